use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const SCHEMA_VERSION: &str = "v1alpha1";

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Exited,
    Signaled,
    Failed,
    Expired,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Signaled => "signaled",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "exited" => Some(Self::Exited),
            "signaled" => Some(Self::Signaled),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Pty,
    Stdout,
    Stderr,
}

impl OutputChannel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pty => "pty",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TransportMode {
    #[serde(rename = "posix-pty")]
    PosixPty,
    #[serde(rename = "windows-conpty")]
    WindowsConPty,
    #[serde(rename = "pipe")]
    Pipe,
}

impl TransportMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::PosixPty => "posix-pty",
            Self::WindowsConPty => "windows-conpty",
            Self::Pipe => "pipe",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostOs {
    Windows,
    Unix,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

pub fn select_transport_mode(tty_attached: bool, os: HostOs) -> TransportMode {
    if !tty_attached {
        return TransportMode::Pipe;
    }
    match os {
        HostOs::Windows => TransportMode::WindowsConPty,
        HostOs::Unix => TransportMode::PosixPty,
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StartMeta {
    pub schema_version: String,
    pub session_id: String,
    pub command: Vec<String>,
    pub working_directory: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub retention_seconds: u64,
    pub transport_mode: TransportMode,
    pub tty_attached: bool,
    pub pid: u32,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FinalMeta {
    pub schema_version: String,
    pub session_id: String,
    pub state: SessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FinalMeta {
    pub fn from_outcome(session_id: &str, ended_at: OffsetDateTime, outcome: &RunResult) -> Self {
        let mut final_meta = Self {
            schema_version: SCHEMA_VERSION.to_string(),
            session_id: session_id.to_string(),
            state: outcome.state(),
            ended_at,
            exit_code: None,
            signal: None,
            error: None,
        };
        match outcome {
            RunResult::Exited { code } => final_meta.exit_code = Some(*code),
            RunResult::Signaled { name, .. } => final_meta.signal = Some(name.clone()),
            RunResult::Failed { error } => final_meta.error = Some(error.clone()),
        }
        final_meta
    }
}

/// Terminal result of one run as recorded in final metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunResult {
    Exited { code: i32 },
    Signaled { name: String, number: i32 },
    Failed { error: String },
}

impl RunResult {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Exited { .. } => SessionState::Exited,
            Self::Signaled { .. } => SessionState::Signaled,
            Self::Failed { .. } => SessionState::Failed,
        }
    }

    /// Shell convention: a signaled child maps to 128 + signal number.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            Self::Signaled { number, .. } => 128 + number,
            Self::Failed { .. } => 1,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u64,
    pub channel: OutputChannel,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl IndexEntry {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputChunk {
    pub channel: OutputChannel,
    pub start_cursor: u64,
    pub end_cursor: u64,
    pub data: Vec<u8>,
    pub timestamp: OffsetDateTime,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputRead {
    pub chunks: Vec<OutputChunk>,
    pub next_cursor: u64,
    pub eof: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<OffsetDateTime>,
    pub transport_mode: TransportMode,
    pub tty_attached: bool,
    pub retention_seconds: u64,
    pub pid: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub output_bytes: u64,
    pub chunk_count: u64,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_chunk_at: Option<OffsetDateTime>,
}
