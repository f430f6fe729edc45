use super::{ChildExit, OutputSinks, RunRequest, StartHook, Transport, TransportError};
use crate::domain::TransportMode;

/// Child attached to a fresh pseudo-terminal sized like the host terminal.
pub struct PosixPtyTransport;

#[cfg(not(unix))]
impl Transport for PosixPtyTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::PosixPty
    }

    fn run(
        &self,
        _request: &RunRequest<'_>,
        _on_start: &mut StartHook<'_>,
        _sinks: &dyn OutputSinks,
    ) -> Result<ChildExit, TransportError> {
        Err(TransportError::Unimplemented {
            mode: TransportMode::PosixPty.label(),
        })
    }
}

#[cfg(unix)]
impl Transport for PosixPtyTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::PosixPty
    }

    fn run(
        &self,
        request: &RunRequest<'_>,
        on_start: &mut StartHook<'_>,
        sinks: &dyn OutputSinks,
    ) -> Result<ChildExit, TransportError> {
        posix::run(request, on_start, sinks)
    }
}

pub(super) fn host_pty_size() -> portable_pty::PtySize {
    let (cols, rows) = match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => (80, 24),
    };
    portable_pty::PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Puts the host terminal in raw mode for the lifetime of the guard, so
/// keystrokes reach the child unprocessed.
pub(super) struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    pub(super) fn enable() -> Self {
        use std::io::IsTerminal;
        let enabled =
            std::io::stdin().is_terminal() && crossterm::terminal::enable_raw_mode().is_ok();
        Self { enabled }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// Relays host stdin into the child's terminal on a detached thread; it blocks
/// on host input and is abandoned when the run ends.
pub(super) fn spawn_stdin_relay(mut writer: Box<dyn std::io::Write + Send>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let _ = std::io::copy(&mut stdin, &mut writer);
    });
}

#[cfg(unix)]
mod posix {
    use super::super::{
        CANCEL_SIGNAL, ChildExit, ForwardTarget, OutputSinks, ResizeListener, RunRequest,
        SignalForwarder, StartHook, TransportError, join_copy, send_signal, spawn_copy,
    };
    use super::{RawModeGuard, host_pty_size, spawn_stdin_relay};
    use crate::domain::OutputChannel;
    use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, native_pty_system};
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::{Arc, Mutex};

    pub(super) fn run(
        request: &RunRequest<'_>,
        on_start: &mut StartHook<'_>,
        sinks: &dyn OutputSinks,
    ) -> Result<ChildExit, TransportError> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or(TransportError::EmptyCommand)?;

        let pair = native_pty_system()
            .openpty(host_pty_size())
            .map_err(|error| TransportError::OpenPty(error.to_string()))?;
        let mut command = CommandBuilder::new(program);
        command.args(args);
        command.cwd(request.working_dir);
        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|error| TransportError::SpawnPty(error.to_string()))?;
        // Only the child may hold the slave side, so reads see EIO once it exits.
        drop(pair.slave);

        let Some(pid) = child.process_id() else {
            kill_and_reap(child.as_mut());
            return Err(TransportError::SpawnPty(
                "child process id unavailable".to_string(),
            ));
        };
        let target = ForwardTarget::ProcessGroup(pid);

        let forwarder = match SignalForwarder::start(target) {
            Ok(forwarder) => forwarder,
            Err(error) => {
                kill_and_reap(child.as_mut());
                return Err(TransportError::Signals(error));
            }
        };
        if let Err(error) = on_start(pid) {
            kill_and_reap(child.as_mut());
            return Err(TransportError::StartHook(error));
        }

        let master: Arc<Mutex<Box<dyn MasterPty + Send>>> = Arc::new(Mutex::new(pair.master));
        let (reader, writer) = {
            let master = master.lock().map_err(|_| {
                TransportError::OpenPty("pseudo-terminal lock poisoned".to_string())
            })?;
            let reader = master
                .try_clone_reader()
                .map_err(|error| TransportError::OpenPty(error.to_string()));
            let writer = master
                .take_writer()
                .map_err(|error| TransportError::OpenPty(error.to_string()));
            (reader, writer)
        };
        let (reader, writer) = match (reader, writer) {
            (Ok(reader), Ok(writer)) => (reader, writer),
            (Err(error), _) | (_, Err(error)) => {
                kill_and_reap(child.as_mut());
                return Err(error);
            }
        };

        let resize_master = Arc::clone(&master);
        let resize = match ResizeListener::start(move || {
            if let Ok(master) = resize_master.lock() {
                let _ = master.resize(host_pty_size());
            }
        }) {
            Ok(resize) => resize,
            Err(error) => {
                kill_and_reap(child.as_mut());
                return Err(TransportError::Signals(error));
            }
        };

        let raw_mode = RawModeGuard::enable();
        spawn_stdin_relay(writer);
        let output_copy = spawn_copy(reader, sinks.open(OutputChannel::Pty), is_pty_closed);

        let cancel_watch = request.cancel.on_cancel(move || {
            let _ = send_signal(target, CANCEL_SIGNAL);
        });
        let status = wait_for_exit(pid);
        drop(cancel_watch);

        let copied = join_copy(output_copy, OutputChannel::Pty);
        drop(resize);
        drop(raw_mode);
        drop(forwarder);
        drop(master);

        let status = status.map_err(TransportError::Wait)?;
        copied?;
        Ok(status)
    }

    /// Reaps the child directly: the wrapper's exit status drops the signal number.
    fn wait_for_exit(pid: u32) -> io::Result<ChildExit> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            if rc == pid {
                break;
            }
            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(error);
            }
        }
        Ok(ChildExit::from_status(std::process::ExitStatus::from_raw(status)))
    }

    fn kill_and_reap(child: &mut (dyn Child + Send + Sync)) {
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Linux reports EIO on the master once the slave side has closed.
    fn is_pty_closed(error: &io::Error) -> bool {
        error.raw_os_error() == Some(libc::EIO) || error.kind() == io::ErrorKind::BrokenPipe
    }

}
