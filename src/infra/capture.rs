use crate::domain::OutputChannel;
use crate::infra::{OutputSinks, SessionStore, StoreError};
use std::io::{self, Write};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
#[error("failed to capture {channel} output for session {session_id}: {source}")]
pub struct CaptureError {
    pub session_id: String,
    pub channel: &'static str,
    #[source]
    pub source: StoreError,
}

/// Turns every write into one appended chunk on a fixed channel.
pub struct CaptureWriter {
    store: SessionStore,
    session_id: String,
    channel: OutputChannel,
}

impl CaptureWriter {
    pub fn new(store: SessionStore, session_id: impl Into<String>, channel: OutputChannel) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            channel,
        }
    }
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let offset = self
            .store
            .append_output(&self.session_id, self.channel, buf, OffsetDateTime::now_utc())
            .map_err(|source| {
                io::Error::other(CaptureError {
                    session_id: self.session_id.clone(),
                    channel: self.channel.label(),
                    source,
                })
            })?;
        tracing::info!(
            session_id = %self.session_id,
            channel = self.channel.label(),
            chunk_offset = offset,
            chunk_size = buf.len(),
            "chunk_written"
        );
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Mirrors captured bytes to a host stream once they are durable.
///
/// A host stream that has gone away (closed pipe) stops being mirrored; the
/// capture keeps going.
pub struct TeeWriter<H, C> {
    host: Option<H>,
    capture: C,
}

impl<H: Write, C: Write> TeeWriter<H, C> {
    pub fn new(host: H, capture: C) -> Self {
        Self {
            host: Some(host),
            capture,
        }
    }
}

impl<H: Write, C: Write> Write for TeeWriter<H, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.capture.write_all(buf)?;
        if let Some(host) = self.host.as_mut() {
            match host.write_all(buf).and_then(|()| host.flush()) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::BrokenPipe => self.host = None,
                Err(error) => return Err(error),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.capture.flush()?;
        if let Some(host) = self.host.as_mut() {
            host.flush()?;
        }
        Ok(())
    }
}

/// Output sinks for one recorded session.
#[derive(Clone, Debug)]
pub struct SessionSinks {
    store: SessionStore,
    session_id: String,
    mirror_to_host: bool,
}

impl SessionSinks {
    pub fn new(store: SessionStore, session_id: impl Into<String>, mirror_to_host: bool) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            mirror_to_host,
        }
    }
}

impl OutputSinks for SessionSinks {
    fn open(&self, channel: OutputChannel) -> Box<dyn Write + Send> {
        let capture = CaptureWriter::new(self.store.clone(), self.session_id.clone(), channel);
        if !self.mirror_to_host {
            return Box::new(capture);
        }
        match channel {
            OutputChannel::Stderr => Box::new(TeeWriter::new(io::stderr(), capture)),
            OutputChannel::Pty | OutputChannel::Stdout => {
                Box::new(TeeWriter::new(io::stdout(), capture))
            }
        }
    }
}
