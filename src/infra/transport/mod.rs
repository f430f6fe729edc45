mod cancel;
mod conpty;
mod pipe;
mod pty;
mod signals;

pub use cancel::*;
pub use conpty::*;
pub use pipe::*;
pub use pty::*;
pub use signals::*;

use crate::domain::{OutputChannel, RunResult, TransportMode};
use std::error::Error as StdError;
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};
use thiserror::Error;

pub type StartHookError = Box<dyn StdError + Send + Sync>;

/// Called with the child pid before any output is copied.
pub type StartHook<'a> = dyn FnMut(u32) -> Result<(), StartHookError> + 'a;

pub trait OutputSinks: Send + Sync {
    fn open(&self, channel: OutputChannel) -> Box<dyn Write + Send>;
}

pub struct RunRequest<'a> {
    pub command: &'a [String],
    pub working_dir: &'a Path,
    pub cancel: &'a CancellationToken,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChildExit {
    Code(i32),
    Signal { name: String, number: i32 },
}

impl ChildExit {
    pub fn into_run_result(self) -> RunResult {
        match self {
            Self::Code(code) => RunResult::Exited { code },
            Self::Signal { name, number } => RunResult::Signaled { name, number },
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(number) = status.signal() {
                return Self::Signal {
                    name: signal_name(number),
                    number,
                };
            }
        }
        Self::Code(status.code().unwrap_or(1))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{mode} transport is not implemented on this platform")]
    Unimplemented { mode: &'static str },

    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to start process: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to open pseudo-terminal: {0}")]
    OpenPty(String),

    #[error("failed to start process in pseudo-terminal: {0}")]
    SpawnPty(String),

    #[error("failed to install signal forwarding: {0}")]
    Signals(#[source] io::Error),

    #[error("start hook failed: {0}")]
    StartHook(#[source] StartHookError),

    #[error("failed to copy {channel} output: {source}")]
    Copy {
        channel: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{channel} output copy thread panicked")]
    CopyPanicked { channel: &'static str },

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

impl TransportError {
    #[cfg(test)]
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented { .. })
    }
}

pub trait Transport {
    fn mode(&self) -> TransportMode;

    fn run(
        &self,
        request: &RunRequest<'_>,
        on_start: &mut StartHook<'_>,
        sinks: &dyn OutputSinks,
    ) -> Result<ChildExit, TransportError>;
}

pub fn transport_for(mode: TransportMode) -> Box<dyn Transport> {
    match mode {
        TransportMode::Pipe => Box::new(PipeTransport),
        TransportMode::PosixPty => Box::new(PosixPtyTransport),
        TransportMode::WindowsConPty => Box::new(ConPtyTransport),
    }
}

/// Copies until EOF; `benign` decides which read errors mean the peer closed.
fn copy_stream(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    benign: fn(&io::Error) -> bool,
) -> io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) if benign(&error) => return Ok(total),
            Err(error) => return Err(error),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn is_closed_pipe(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::BrokenPipe
}

fn spawn_copy<R>(
    mut reader: R,
    mut writer: Box<dyn Write + Send>,
    benign: fn(&io::Error) -> bool,
) -> JoinHandle<io::Result<u64>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let copied = copy_stream(&mut reader, writer.as_mut(), benign)?;
        writer.flush()?;
        Ok(copied)
    })
}

fn join_copy(
    handle: JoinHandle<io::Result<u64>>,
    channel: OutputChannel,
) -> Result<u64, TransportError> {
    match handle.join() {
        Ok(Ok(copied)) => Ok(copied),
        Ok(Err(source)) => Err(TransportError::Copy {
            channel: channel.label(),
            source,
        }),
        Err(_) => Err(TransportError::CopyPanicked {
            channel: channel.label(),
        }),
    }
}
