use super::{
    CANCEL_SIGNAL, ChildExit, ForwardTarget, OutputSinks, RunRequest, SignalForwarder, StartHook,
    Transport, TransportError, is_closed_pipe, join_copy, send_signal, spawn_copy,
};
use crate::domain::{OutputChannel, TransportMode};
use std::io;
use std::process::{Child, Command, Stdio};

/// Separate stdout/stderr pipes, host stdin inherited.
pub struct PipeTransport;

impl Transport for PipeTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Pipe
    }

    fn run(
        &self,
        request: &RunRequest<'_>,
        on_start: &mut StartHook<'_>,
        sinks: &dyn OutputSinks,
    ) -> Result<ChildExit, TransportError> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or(TransportError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(request.working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TransportError::Spawn)?;
        let pid = child.id();

        // Forwarding is live before the start hook so an early Ctrl-C still
        // reaches the child instead of killing the recorder.
        let forwarder = match SignalForwarder::start(ForwardTarget::Process(pid)) {
            Ok(forwarder) => forwarder,
            Err(error) => {
                kill_and_reap(&mut child);
                return Err(TransportError::Signals(error));
            }
        };
        if let Err(error) = on_start(pid) {
            kill_and_reap(&mut child);
            return Err(TransportError::StartHook(error));
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            kill_and_reap(&mut child);
            return Err(TransportError::Spawn(io::Error::other(
                "child output pipes missing",
            )));
        };
        let stdout_copy = spawn_copy(stdout, sinks.open(OutputChannel::Stdout), is_closed_pipe);
        let stderr_copy = spawn_copy(stderr, sinks.open(OutputChannel::Stderr), is_closed_pipe);

        let cancel_watch = request.cancel.on_cancel(move || {
            let _ = send_signal(ForwardTarget::Process(pid), CANCEL_SIGNAL);
        });
        let status = child.wait();
        drop(cancel_watch);

        let stdout_result = join_copy(stdout_copy, OutputChannel::Stdout);
        let stderr_result = join_copy(stderr_copy, OutputChannel::Stderr);
        drop(forwarder);

        let status = status.map_err(TransportError::Wait)?;
        stdout_result?;
        stderr_result?;
        Ok(ChildExit::from_status(status))
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
