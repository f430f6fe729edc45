use std::io;
use std::thread::JoinHandle;

#[cfg(unix)]
const SIGNAL_NAMES: &[(libc::c_int, &str)] = &[
    (libc::SIGHUP, "SIGHUP"),
    (libc::SIGINT, "SIGINT"),
    (libc::SIGQUIT, "SIGQUIT"),
    (libc::SIGILL, "SIGILL"),
    (libc::SIGTRAP, "SIGTRAP"),
    (libc::SIGABRT, "SIGABRT"),
    (libc::SIGBUS, "SIGBUS"),
    (libc::SIGFPE, "SIGFPE"),
    (libc::SIGKILL, "SIGKILL"),
    (libc::SIGUSR1, "SIGUSR1"),
    (libc::SIGSEGV, "SIGSEGV"),
    (libc::SIGUSR2, "SIGUSR2"),
    (libc::SIGPIPE, "SIGPIPE"),
    (libc::SIGALRM, "SIGALRM"),
    (libc::SIGTERM, "SIGTERM"),
    (libc::SIGCHLD, "SIGCHLD"),
    (libc::SIGCONT, "SIGCONT"),
    (libc::SIGSTOP, "SIGSTOP"),
    (libc::SIGTSTP, "SIGTSTP"),
    (libc::SIGTTIN, "SIGTTIN"),
    (libc::SIGTTOU, "SIGTTOU"),
    (libc::SIGURG, "SIGURG"),
    (libc::SIGXCPU, "SIGXCPU"),
    (libc::SIGXFSZ, "SIGXFSZ"),
    (libc::SIGVTALRM, "SIGVTALRM"),
    (libc::SIGPROF, "SIGPROF"),
    (libc::SIGWINCH, "SIGWINCH"),
    (libc::SIGSYS, "SIGSYS"),
];

/// SIGTERM, sent to the child when a run is cancelled.
pub const CANCEL_SIGNAL: i32 = 15;

pub fn signal_name(number: i32) -> String {
    #[cfg(unix)]
    {
        if let Some((_, name)) = SIGNAL_NAMES.iter().find(|(signal, _)| *signal == number) {
            return (*name).to_string();
        }
    }
    format!("SIG{number}")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForwardTarget {
    Process(u32),
    /// The child leads its own process group (pseudo-terminal sessions).
    ProcessGroup(u32),
}

#[cfg(unix)]
pub fn send_signal(target: ForwardTarget, signal: i32) -> io::Result<()> {
    let (pid, group) = match target {
        ForwardTarget::Process(pid) => (pid, false),
        ForwardTarget::ProcessGroup(pid) => (pid, true),
    };
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::kill(if group { -pid } else { pid }, signal) };
    if rc == 0 {
        return Ok(());
    }
    let error = io::Error::last_os_error();
    if group && error.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone or never formed; fall back to the leader.
        return send_signal(ForwardTarget::Process(pid as u32), signal);
    }
    Err(error)
}

#[cfg(not(unix))]
pub fn send_signal(_target: ForwardTarget, _signal: i32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Relays SIGINT, SIGTERM and SIGHUP received by this process to the child
/// until dropped.
pub struct SignalForwarder {
    #[cfg(unix)]
    handle: signal_hook::iterator::Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalForwarder {
    #[cfg(unix)]
    pub fn start(target: ForwardTarget) -> io::Result<Self> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let handle = signals.handle();
        let thread = std::thread::spawn(move || {
            for signal in signals.forever() {
                let result = send_signal(target, signal);
                tracing::info!(
                    signal = %signal_name(signal),
                    ?target,
                    ok = result.is_ok(),
                    "signal_forwarded"
                );
            }
        });
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    #[cfg(not(unix))]
    pub fn start(_target: ForwardTarget) -> io::Result<Self> {
        Ok(Self { thread: None })
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Invokes `on_resize` for every SIGWINCH until dropped.
#[cfg(unix)]
pub struct ResizeListener {
    handle: signal_hook::iterator::Handle,
    thread: Option<JoinHandle<()>>,
}

#[cfg(unix)]
impl ResizeListener {
    pub fn start<F>(mut on_resize: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGWINCH])?;
        let handle = signals.handle();
        let thread = std::thread::spawn(move || {
            for _ in signals.forever() {
                on_resize();
            }
        });
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

#[cfg(unix)]
impl Drop for ResizeListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
