use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    changed: Condvar,
}

impl CancelState {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared cancellation flag handed from a caller to a running transport.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.state.lock();
        *cancelled = true;
        self.state.changed.notify_all();
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        *self.state.lock()
    }

    /// Blocks until cancelled or `timeout` elapses; returns whether cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.state.lock();
        let (guard, _) = self
            .state
            .changed
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Runs `action` once on a helper thread if the token is cancelled before
    /// the returned watch is dropped.
    pub fn on_cancel<F>(&self, action: F) -> CancelWatch
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let finished = Arc::new(AtomicBool::new(false));
        let finished_thread = Arc::clone(&finished);
        let thread = thread::spawn(move || {
            let guard = state.lock();
            let guard = state
                .changed
                .wait_while(guard, |cancelled| {
                    !*cancelled && !finished_thread.load(Ordering::SeqCst)
                })
                .unwrap_or_else(PoisonError::into_inner);
            let cancelled = *guard;
            drop(guard);
            if cancelled && !finished_thread.load(Ordering::SeqCst) {
                action();
            }
        });
        CancelWatch {
            state: Arc::clone(&self.state),
            finished,
            thread: Some(thread),
        }
    }
}

pub struct CancelWatch {
    state: Arc<CancelState>,
    finished: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        {
            let _guard = self.state.lock();
            self.finished.store(true, Ordering::SeqCst);
            self.state.changed.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
