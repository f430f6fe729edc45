use super::{ChildExit, OutputSinks, RunRequest, StartHook, Transport, TransportError};
use crate::domain::TransportMode;

/// Windows pseudo-console. There are no signals to forward on that platform,
/// so cancellation terminates the child outright.
pub struct ConPtyTransport;

impl Transport for ConPtyTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::WindowsConPty
    }

    #[cfg(not(windows))]
    fn run(
        &self,
        _request: &RunRequest<'_>,
        _on_start: &mut StartHook<'_>,
        _sinks: &dyn OutputSinks,
    ) -> Result<ChildExit, TransportError> {
        Err(TransportError::Unimplemented {
            mode: TransportMode::WindowsConPty.label(),
        })
    }

    #[cfg(windows)]
    fn run(
        &self,
        request: &RunRequest<'_>,
        on_start: &mut StartHook<'_>,
        sinks: &dyn OutputSinks,
    ) -> Result<ChildExit, TransportError> {
        windows::run(request, on_start, sinks)
    }
}

#[cfg(windows)]
mod windows {
    use super::super::pty::{RawModeGuard, host_pty_size, spawn_stdin_relay};
    use super::super::{
        ChildExit, OutputSinks, RunRequest, StartHook, TransportError, join_copy, spawn_copy,
    };
    use crate::domain::OutputChannel;
    use portable_pty::{Child, ChildKiller, CommandBuilder, native_pty_system};
    use std::io;

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
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        if let Err(error) = on_start(pid) {
            kill_and_reap(child.as_mut());
            return Err(TransportError::StartHook(error));
        }

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|error| TransportError::OpenPty(error.to_string()));
        let writer = pair
            .master
            .take_writer()
            .map_err(|error| TransportError::OpenPty(error.to_string()));
        let (reader, writer) = match (reader, writer) {
            (Ok(reader), Ok(writer)) => (reader, writer),
            (Err(error), _) | (_, Err(error)) => {
                kill_and_reap(child.as_mut());
                return Err(error);
            }
        };

        let raw_mode = RawModeGuard::enable();
        spawn_stdin_relay(writer);
        let output_copy = spawn_copy(reader, sinks.open(OutputChannel::Pty), is_console_closed);

        let mut killer = child.clone_killer();
        let cancel_watch = request.cancel.on_cancel(move || {
            let _ = killer.kill();
        });
        let status = child.wait();
        drop(cancel_watch);

        // The pseudo-console only reports EOF once it is closed.
        drop(pair.master);
        let copied = join_copy(output_copy, OutputChannel::Pty);
        drop(raw_mode);

        let status = status.map_err(TransportError::Wait)?;
        copied?;
        Ok(ChildExit::Code(status.exit_code() as i32))
    }

    fn kill_and_reap(child: &mut (dyn Child + Send + Sync)) {
        let _ = child.kill();
        let _ = child.wait();
    }

    fn is_console_closed(error: &io::Error) -> bool {
        error.kind() == io::ErrorKind::BrokenPipe
    }
}
