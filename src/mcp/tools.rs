use crate::domain::{
    OutputChannel, OutputChunk, OutputRead, SCHEMA_VERSION, SessionDetail, SessionState,
    SessionSummary,
};
use crate::infra::{
    DEFAULT_READ_BYTES, SessionFilter, SessionStore, StoreError, WatchSignal, watch_session_dir,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;

pub const LIST_SESSIONS: &str = "derun_list_sessions";
pub const GET_SESSION: &str = "derun_get_session";
pub const READ_OUTPUT: &str = "derun_read_output";
pub const WAIT_OUTPUT: &str = "derun_wait_output";

const DEFAULT_LIST_LIMIT: usize = 50;
pub const DEFAULT_WAIT: Duration = Duration::from_secs(30);
pub const MAX_WAIT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0} is required")]
    MissingArgument(&'static str),

    #[error("parse {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("{operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ToolError {
    fn store(operation: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { operation, source }
    }
}

type Args = Map<String, Value>;

pub fn tool_definitions() -> Value {
    json!([
        {
            "name": LIST_SESSIONS,
            "description": "List recent sessions, newest first, with optional state and id prefix filters.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "state": {
                        "type": "string",
                        "enum": ["starting", "running", "exited", "signaled", "failed", "expired"]
                    },
                    "id_prefix": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1 }
                }
            }
        },
        {
            "name": GET_SESSION,
            "description": "Get detailed metadata and output stats for one session.",
            "inputSchema": {
                "type": "object",
                "required": ["session_id"],
                "properties": {
                    "session_id": { "type": "string" }
                }
            }
        },
        {
            "name": READ_OUTPUT,
            "description": "Read output chunks from a cursor.",
            "inputSchema": {
                "type": "object",
                "required": ["session_id"],
                "properties": {
                    "session_id": { "type": "string" },
                    "cursor": { "type": "string" },
                    "max_bytes": { "type": "integer", "minimum": 1 }
                }
            }
        },
        {
            "name": WAIT_OUTPUT,
            "description": "Wait until output past the cursor appears or the session ends, then read it.",
            "inputSchema": {
                "type": "object",
                "required": ["session_id", "cursor"],
                "properties": {
                    "session_id": { "type": "string" },
                    "cursor": { "type": "string" },
                    "max_bytes": { "type": "integer", "minimum": 1 },
                    "timeout_ms": { "type": "integer", "minimum": 1 }
                }
            }
        }
    ])
}

pub fn call_tool(store: &SessionStore, name: &str, args: &Args) -> Result<Value, ToolError> {
    match name {
        LIST_SESSIONS => list_sessions(store, args),
        GET_SESSION => get_session(store, args),
        READ_OUTPUT => read_output(store, args),
        WAIT_OUTPUT => wait_output(store, args),
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct WireChunk {
    channel: OutputChannel,
    start_cursor: String,
    end_cursor: String,
    data_base64: String,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl From<OutputChunk> for WireChunk {
    fn from(chunk: OutputChunk) -> Self {
        Self {
            channel: chunk.channel,
            start_cursor: chunk.start_cursor.to_string(),
            end_cursor: chunk.end_cursor.to_string(),
            data_base64: BASE64.encode(&chunk.data),
            timestamp: chunk.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionListPayload {
    schema_version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    generated_at: OffsetDateTime,
    total_count: usize,
    truncated: bool,
    sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
struct SessionPayload {
    schema_version: &'static str,
    session: SessionDetail,
}

#[derive(Debug, Serialize)]
struct OutputPayload {
    schema_version: &'static str,
    session_id: String,
    chunks: Vec<WireChunk>,
    next_cursor: String,
    eof: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timed_out: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    waited_ms: Option<u64>,
}

impl OutputPayload {
    fn new(session_id: &str, read: OutputRead) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: session_id.to_string(),
            chunks: read.chunks.into_iter().map(WireChunk::from).collect(),
            next_cursor: read.next_cursor.to_string(),
            eof: read.eof,
            timed_out: None,
            waited_ms: None,
        }
    }

    fn waited(mut self, timed_out: bool, waited: Duration) -> Self {
        self.timed_out = Some(timed_out);
        self.waited_ms = Some(u64::try_from(waited.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

fn list_sessions(store: &SessionStore, args: &Args) -> Result<Value, ToolError> {
    let state = match optional_str(args, "state")? {
        Some(raw) => Some(SessionState::parse(raw).ok_or_else(|| ToolError::InvalidArgument {
            name: "state",
            reason: format!("unknown session state {raw:?}"),
        })?),
        None => None,
    };
    let filter = SessionFilter {
        id_prefix: optional_str(args, "id_prefix")?.map(str::to_string),
        state,
    };
    let limit = positive_int(args, "limit")?
        .and_then(|limit| usize::try_from(limit).ok())
        .unwrap_or(DEFAULT_LIST_LIMIT);

    let list = store
        .list_sessions(&filter, limit)
        .map_err(ToolError::store("list sessions"))?;
    let payload = SessionListPayload {
        schema_version: SCHEMA_VERSION,
        generated_at: OffsetDateTime::now_utc(),
        total_count: list.total,
        truncated: list.total > list.sessions.len(),
        sessions: list.sessions,
    };
    Ok(serde_json::to_value(payload)?)
}

fn get_session(store: &SessionStore, args: &Args) -> Result<Value, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let detail = store
        .get_session(session_id)
        .map_err(ToolError::store("get session"))?;
    let payload = SessionPayload {
        schema_version: SCHEMA_VERSION,
        session: detail,
    };
    Ok(serde_json::to_value(payload)?)
}

fn read_output(store: &SessionStore, args: &Args) -> Result<Value, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let cursor = match optional_str(args, "cursor")? {
        Some(raw) => parse_cursor(raw)?,
        None => 0,
    };
    let max_bytes = max_bytes(args)?;

    let read = store
        .read_output(session_id, cursor, max_bytes)
        .map_err(ToolError::store("read output"))?;
    Ok(serde_json::to_value(OutputPayload::new(session_id, read))?)
}

/// Blocks until bytes past `cursor` exist, the session reaches a terminal
/// state, or the timeout lapses. Directory change notifications cut the wait
/// short; a bounded poll covers missed or unsupported notifications.
fn wait_output(store: &SessionStore, args: &Args) -> Result<Value, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let cursor = parse_cursor(required_str(args, "cursor")?)?;
    let max_bytes = max_bytes(args)?;
    let timeout = positive_int(args, "timeout_ms")?
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WAIT)
        .min(MAX_WAIT);

    let started = Instant::now();
    let watcher = store
        .existing_session_dir(session_id)
        .ok()
        .and_then(|dir| watch_session_dir(&dir).ok());
    loop {
        let read = store
            .read_output(session_id, cursor, max_bytes)
            .map_err(ToolError::store("wait read output"))?;
        if !read.chunks.is_empty() || read.eof {
            let payload = OutputPayload::new(session_id, read).waited(false, started.elapsed());
            return Ok(serde_json::to_value(payload)?);
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            let payload = OutputPayload::new(session_id, read).waited(true, timeout);
            return Ok(serde_json::to_value(payload)?);
        }
        let pause = (timeout - elapsed).min(POLL_INTERVAL);
        match &watcher {
            Some(watcher) => {
                if let Some(WatchSignal::Error(error)) = watcher.wait(pause) {
                    tracing::debug!(session_id, error = %error, "wait_watch_error");
                }
            }
            None => std::thread::sleep(pause),
        }
    }
}

fn required_str<'a>(args: &'a Args, name: &'static str) -> Result<&'a str, ToolError> {
    optional_str(args, name)?.ok_or(ToolError::MissingArgument(name))
}

fn optional_str<'a>(args: &'a Args, name: &'static str) -> Result<Option<&'a str>, ToolError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(other) => Err(ToolError::InvalidArgument {
            name,
            reason: format!("expected string, got {other}"),
        }),
    }
}

/// Integer argument; zero or negative values mean "use the default".
fn positive_int(args: &Args, name: &'static str) -> Result<Option<u64>, ToolError> {
    let value = match args.get(name) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    let number = value
        .as_i64()
        .or_else(|| value.as_f64().map(|value| value as i64))
        .ok_or_else(|| ToolError::InvalidArgument {
            name,
            reason: format!("expected integer, got {value}"),
        })?;
    Ok(u64::try_from(number).ok().filter(|number| *number > 0))
}

fn max_bytes(args: &Args) -> Result<usize, ToolError> {
    Ok(positive_int(args, "max_bytes")?
        .and_then(|value| usize::try_from(value).ok())
        .unwrap_or(DEFAULT_READ_BYTES))
}

fn parse_cursor(raw: &str) -> Result<u64, ToolError> {
    raw.parse::<u64>().map_err(|error| ToolError::InvalidArgument {
        name: "cursor",
        reason: error.to_string(),
    })
}
