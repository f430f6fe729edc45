use notify::event::EventKind;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::time::Duration;
use thiserror::Error;

/// Artifacts whose changes can make new output or a final state visible.
const WAKE_FILES: &[&str] = &["output.bin", "index.jsonl", "final.json"];

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchSignal {
    Changed,
    Error(String),
}

#[derive(Debug)]
pub struct SessionDirWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<WatchSignal>,
}

impl SessionDirWatcher {
    /// Blocks until the next relevant change or `timeout`; `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<WatchSignal> {
        match self.rx.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(WatchSignal::Error("watcher disconnected".to_string()))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum WatchSessionDirError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
}

pub fn watch_session_dir(path: &Path) -> Result<SessionDirWatcher, WatchSessionDirError> {
    let (tx, rx) = channel::<WatchSignal>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if should_wake(&event) {
                    let _ = tx.send(WatchSignal::Changed);
                }
            }
            Err(error) => {
                let _ = tx.send(WatchSignal::Error(error.to_string()));
            }
        },
        Config::default(),
    )?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;

    Ok(SessionDirWatcher {
        _watcher: watcher,
        rx,
    })
}

fn should_wake(event: &notify::Event) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    if event.paths.is_empty() {
        return true;
    }

    event.paths.iter().any(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| WAKE_FILES.contains(&name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn wakes_on_output_and_final_metadata() {
        assert!(should_wake(&event(
            EventKind::Modify(ModifyKind::Any),
            &["/s/ID/output.bin"]
        )));
        assert!(should_wake(&event(
            EventKind::Create(CreateKind::File),
            &["/s/ID/final.json"]
        )));
        assert!(should_wake(&event(EventKind::Any, &[])));
    }

    #[test]
    fn ignores_reads_and_unrelated_files() {
        assert!(!should_wake(&event(
            EventKind::Access(AccessKind::Any),
            &["/s/ID/output.bin"]
        )));
        assert!(!should_wake(&event(
            EventKind::Modify(ModifyKind::Any),
            &["/s/ID/append.lock"]
        )));
        assert!(!should_wake(&event(
            EventKind::Create(CreateKind::File),
            &["/s/ID/.meta.json.42.tmp"]
        )));
    }

    #[test]
    fn wait_times_out_without_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let watcher = watch_session_dir(dir.path()).expect("watch");
        assert_eq!(watcher.wait(Duration::from_millis(20)), None);
    }
}
