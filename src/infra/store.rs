use crate::domain::{
    FinalMeta, IndexEntry, OutputChannel, OutputChunk, OutputRead, SessionDetail, SessionState,
    SessionSummary, StartMeta,
};
use crate::infra::{
    ensure_private_dir, escaping_target, is_strict_descendant, process_alive, resolve_real_path,
    set_private_mode,
};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;

pub const DEFAULT_READ_BYTES: usize = 64 * 1024;

const SESSIONS_DIR: &str = "sessions";
const META_FILE: &str = "meta.json";
const FINAL_FILE: &str = "final.json";
const OUTPUT_FILE: &str = "output.bin";
const INDEX_FILE: &str = "index.jsonl";
const LOCK_FILE: &str = "append.lock";
const INDEX_TAIL_BYTES: u64 = 4096;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid session id {session_id:?}: {reason}")]
    InvalidSessionId {
        session_id: String,
        reason: &'static str,
    },

    #[error("refusing symlinked path {path}: resolves outside session storage to {resolved}")]
    SymlinkEscape { path: PathBuf, resolved: PathBuf },

    #[error("session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode or decode JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_symlink_escape(&self) -> bool {
        matches!(self, Self::SymlinkEscape { .. })
    }

    #[cfg(test)]
    pub fn is_invalid_session_id(&self) -> bool {
        matches!(self, Self::InvalidSessionId { .. })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionFilter {
    pub id_prefix: Option<String>,
    pub state: Option<SessionState>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

/// On-disk session ledger rooted at `<root>/sessions`.
///
/// Every operation re-resolves real paths, so a session directory or artifact
/// swapped for a symlink after creation is still caught on the next access.
#[derive(Clone, Debug)]
pub struct SessionStore {
    sessions_root: PathBuf,
}

impl SessionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let sessions_root = root.join(SESSIONS_DIR);
        ensure_private_dir(&root).map_err(|error| StoreError::io("creating", &root, error))?;
        ensure_private_dir(&sessions_root)
            .map_err(|error| StoreError::io("creating", &sessions_root, error))?;
        Ok(Self { sessions_root })
    }

    #[cfg(test)]
    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    pub fn ensure_session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        self.session_dir(session_id, true)
    }

    pub fn has_session_metadata(&self, session_id: &str) -> Result<bool, StoreError> {
        let dir = match self.session_dir(session_id, false) {
            Ok(dir) => dir,
            Err(StoreError::NotFound { .. }) => return Ok(false),
            Err(error) => return Err(error),
        };
        for name in [META_FILE, FINAL_FILE] {
            let path = self.artifact(session_id, &dir, name)?;
            match fs::metadata(&path) {
                Ok(_) => return Ok(true),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(StoreError::io("inspecting", path, error)),
            }
        }
        Ok(false)
    }

    pub fn write_start_meta(&self, meta: &StartMeta) -> Result<(), StoreError> {
        let dir = self.ensure_session_dir(&meta.session_id)?;
        let path = self.artifact(&meta.session_id, &dir, META_FILE)?;
        write_json_atomic(&path, meta)
    }

    pub fn write_final_meta(&self, final_meta: &FinalMeta) -> Result<(), StoreError> {
        let dir = self.ensure_session_dir(&final_meta.session_id)?;
        let path = self.artifact(&final_meta.session_id, &dir, FINAL_FILE)?;
        write_json_atomic(&path, final_meta)
    }

    pub fn read_start_meta(&self, session_id: &str) -> Result<StartMeta, StoreError> {
        let dir = self.session_dir(session_id, false)?;
        let path = self.artifact(session_id, &dir, META_FILE)?;
        read_json_file(&path)?.ok_or_else(|| StoreError::NotFound {
            session_id: session_id.to_string(),
        })
    }

    pub fn read_final_meta(&self, session_id: &str) -> Result<Option<FinalMeta>, StoreError> {
        let dir = self.session_dir(session_id, false)?;
        let path = self.artifact(session_id, &dir, FINAL_FILE)?;
        read_json_file(&path)
    }

    /// Appends one chunk and returns the global cursor at which it starts.
    pub fn append_output(
        &self,
        session_id: &str,
        channel: OutputChannel,
        data: &[u8],
        timestamp: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let dir = self.ensure_session_dir(session_id)?;
        let lock_path = self.artifact(session_id, &dir, LOCK_FILE)?;
        let output_path = self.artifact(session_id, &dir, OUTPUT_FILE)?;
        let index_path = self.artifact(session_id, &dir, INDEX_FILE)?;

        let _lock = AppendLock::acquire(&lock_path)?;

        let mut output = open_private(
            &output_path,
            OpenOptions::new().create(true).read(true).write(true),
        )
        .map_err(|error| StoreError::io("opening", &output_path, error))?;
        let output_len = output
            .seek(SeekFrom::End(0))
            .map_err(|error| StoreError::io("seeking", &output_path, error))?;
        let offset = self.indexed_end(session_id, &dir, &index_path, output_len)?;
        if offset < output_len {
            // Bytes past the last index record come from an append that died
            // before indexing them; they were never readable.
            output
                .set_len(offset)
                .and_then(|()| output.seek(SeekFrom::Start(offset)).map(drop))
                .map_err(|error| StoreError::io("truncating", &output_path, error))?;
            tracing::warn!(
                session_id = %session_id,
                orphaned_bytes = output_len - offset,
                "output_truncated"
            );
        }
        if data.is_empty() {
            return Ok(offset);
        }
        output
            .write_all(data)
            .and_then(|()| output.sync_data())
            .map_err(|error| StoreError::io("appending output to", &output_path, error))?;

        let entry = IndexEntry {
            offset,
            length: data.len() as u64,
            channel,
            timestamp: timestamp.to_offset(time::UtcOffset::UTC),
        };
        let mut line = serde_json::to_vec(&entry).map_err(|source| StoreError::Json {
            path: index_path.clone(),
            source,
        })?;
        line.push(b'\n');

        let mut index = open_private(
            &index_path,
            OpenOptions::new().create(true).read(true).append(true),
        )
        .map_err(|error| StoreError::io("opening", &index_path, error))?;
        if ends_with_torn_line(&mut index)
            .map_err(|error| StoreError::io("reading", &index_path, error))?
        {
            line.insert(0, b'\n');
        }
        index
            .write_all(&line)
            .and_then(|()| index.sync_data())
            .map_err(|error| StoreError::io("appending index to", &index_path, error))?;

        Ok(offset)
    }

    /// Returns up to `max_bytes` (default 64 KiB) starting at `cursor`.
    ///
    /// Only index entries fully backed by bytes in the output file are used,
    /// so an append that is still in flight is simply not visible yet.
    pub fn read_output(
        &self,
        session_id: &str,
        cursor: u64,
        max_bytes: usize,
    ) -> Result<OutputRead, StoreError> {
        let budget = if max_bytes == 0 {
            DEFAULT_READ_BYTES
        } else {
            max_bytes
        } as u64;

        let dir = self.session_dir(session_id, false)?;
        // State first: once final metadata exists no further appends happen, so
        // the index snapshot taken afterwards is complete.
        let terminal = match self.session_state(session_id) {
            Ok(state) => state.is_terminal(),
            Err(error) if error.is_not_found() => false,
            Err(error) => return Err(error),
        };
        let (output_path, entries) = self.trusted_entries(session_id, &dir)?;
        let total = entries.iter().map(IndexEntry::end).max().unwrap_or(0);
        let cursor = cursor.min(total);

        let mut output = if cursor < total {
            Some(
                File::open(&output_path)
                    .map_err(|error| StoreError::io("opening", &output_path, error))?,
            )
        } else {
            None
        };
        let mut chunks = Vec::new();
        let mut next_cursor = cursor;
        let mut remaining = budget;
        for entry in &entries {
            if remaining == 0 {
                break;
            }
            if entry.end() <= next_cursor {
                continue;
            }
            let start = entry.offset.max(next_cursor);
            let end = entry.end().min(start + remaining);
            if end <= start {
                continue;
            }

            let Some(file) = output.as_mut() else {
                break;
            };
            let mut data = vec![0u8; (end - start) as usize];
            file.seek(SeekFrom::Start(start))
                .and_then(|_| file.read_exact(&mut data))
                .map_err(|error| StoreError::io("reading output from", &output_path, error))?;

            chunks.push(OutputChunk {
                channel: entry.channel,
                start_cursor: start,
                end_cursor: end,
                data,
                timestamp: entry.timestamp,
            });
            remaining -= end - start;
            next_cursor = end;
        }

        Ok(OutputRead {
            chunks,
            next_cursor,
            eof: next_cursor >= total && terminal,
        })
    }

    /// Byte count covered by trusted index entries.
    #[cfg(test)]
    pub fn output_total(&self, session_id: &str) -> Result<u64, StoreError> {
        let dir = self.session_dir(session_id, false)?;
        let (_, entries) = self.trusted_entries(session_id, &dir)?;
        Ok(entries.iter().map(IndexEntry::end).max().unwrap_or(0))
    }

    pub fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: usize,
    ) -> Result<SessionList, StoreError> {
        let mut sessions = Vec::new();
        for session_id in self.list_session_ids()? {
            if let Some(prefix) = filter.id_prefix.as_deref() {
                if !session_id.starts_with(prefix) {
                    continue;
                }
            }
            let Ok(detail) = self.get_session(&session_id) else {
                continue;
            };
            if filter.state.is_some_and(|state| state != detail.summary.state) {
                continue;
            }
            sessions.push(detail.summary);
        }

        sessions.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        let total = sessions.len();
        if limit > 0 {
            sessions.truncate(limit);
        }
        Ok(SessionList { sessions, total })
    }

    /// Names of real (non-symlink) directories under the sessions root.
    pub fn list_session_ids(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.sessions_root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(StoreError::io("listing", &self.sessions_root, error)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|error| StoreError::io("listing", &self.sessions_root, error))?;
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionDetail, StoreError> {
        let dir = self.session_dir(session_id, false)?;
        let meta = self.read_start_meta(session_id)?;
        let final_meta = self.read_final_meta(session_id)?;

        let output_path = self.artifact(session_id, &dir, OUTPUT_FILE)?;
        let output_bytes = file_len(&output_path)?;
        let entries = self.read_index(session_id, &dir)?;
        let last_chunk_at = entries.last().map(|entry| entry.timestamp);

        let state = match &final_meta {
            Some(final_meta) => final_meta.state,
            None => infer_unfinished_state(meta.pid),
        };
        let (ended_at, exit_code, signal, error) = match final_meta {
            Some(final_meta) => (
                Some(final_meta.ended_at),
                final_meta.exit_code,
                final_meta.signal,
                final_meta.error,
            ),
            None => (None, None, None, None),
        };

        Ok(SessionDetail {
            summary: SessionSummary {
                session_id: meta.session_id,
                state,
                started_at: meta.started_at,
                ended_at,
                transport_mode: meta.transport_mode,
                tty_attached: meta.tty_attached,
                retention_seconds: meta.retention_seconds,
                pid: meta.pid,
            },
            exit_code,
            signal,
            error,
            output_bytes,
            chunk_count: entries.len() as u64,
            last_chunk_at,
        })
    }

    /// Validated, escape-checked directory path for an existing session.
    pub fn existing_session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        self.session_dir(session_id, false)
    }

    pub fn remove_session(&self, session_id: &str) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        let path = self.sessions_root.join(session_id);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(StoreError::io("inspecting", path, error)),
        };
        // A symlinked entry is unlinked, never followed.
        let result = if meta.file_type().is_symlink() {
            fs::remove_file(&path)
        } else {
            fs::remove_dir_all(&path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StoreError::io("removing", path, error)),
        }
    }

    fn session_state(&self, session_id: &str) -> Result<SessionState, StoreError> {
        if let Some(final_meta) = self.read_final_meta(session_id)? {
            return Ok(final_meta.state);
        }
        let meta = self.read_start_meta(session_id)?;
        Ok(infer_unfinished_state(meta.pid))
    }

    fn session_dir(&self, session_id: &str, create: bool) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id)?;
        let sessions_real = fs::canonicalize(&self.sessions_root)
            .map_err(|error| StoreError::io("resolving", &self.sessions_root, error))?;
        let dir = self.sessions_root.join(session_id);

        match fs::symlink_metadata(&dir) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                if !create {
                    return Err(StoreError::NotFound {
                        session_id: session_id.to_string(),
                    });
                }
                match fs::create_dir(&dir) {
                    Ok(()) => set_private_mode(&dir, 0o700)
                        .map_err(|error| StoreError::io("securing", &dir, error))?,
                    Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(error) => return Err(StoreError::io("creating", &dir, error)),
                }
            }
            Err(error) => return Err(StoreError::io("inspecting", &dir, error)),
        }

        let resolved =
            resolve_real_path(&dir).map_err(|error| StoreError::io("resolving", &dir, error))?;
        if !is_strict_descendant(&sessions_real, &resolved) {
            return Err(reject_path(session_id, dir, resolved));
        }
        if !resolved.exists() {
            // Dangling link that still points inside the sessions root.
            if !create {
                return Err(StoreError::NotFound {
                    session_id: session_id.to_string(),
                });
            }
            ensure_private_dir(&resolved)
                .map_err(|error| StoreError::io("creating", &resolved, error))?;
        }
        Ok(resolved)
    }

    fn artifact(&self, session_id: &str, dir: &Path, name: &str) -> Result<PathBuf, StoreError> {
        let path = dir.join(name);
        let escaped = escaping_target(dir, &path)
            .map_err(|error| StoreError::io("resolving", &path, error))?;
        match escaped {
            Some(resolved) => Err(reject_path(session_id, path, resolved)),
            None => Ok(path),
        }
    }

    fn trusted_entries(
        &self,
        session_id: &str,
        dir: &Path,
    ) -> Result<(PathBuf, Vec<IndexEntry>), StoreError> {
        let output_path = self.artifact(session_id, dir, OUTPUT_FILE)?;
        let output_len = file_len(&output_path)?;
        let entries = self
            .read_index(session_id, dir)?
            .into_iter()
            .filter(|entry| entry.end() <= output_len)
            .collect();
        Ok((output_path, entries))
    }

    /// End of the last index record backed by output bytes, read from the
    /// index tail when possible.
    fn indexed_end(
        &self,
        session_id: &str,
        dir: &Path,
        index_path: &Path,
        output_len: u64,
    ) -> Result<u64, StoreError> {
        let mut file = match File::open(index_path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(StoreError::io("opening", index_path, error)),
        };
        let mut tail = Vec::new();
        let start = file
            .metadata()
            .map(|meta| meta.len().saturating_sub(INDEX_TAIL_BYTES))
            .and_then(|start| file.seek(SeekFrom::Start(start)))
            .and_then(|start| file.read_to_end(&mut tail).map(|_| start))
            .map_err(|error| StoreError::io("reading", index_path, error))?;

        // The first line of a partial window may be cut mid-record.
        let tail_end = tail
            .split(|byte| *byte == b'\n')
            .skip(usize::from(start > 0))
            .filter_map(|line| serde_json::from_slice::<IndexEntry>(line.trim_ascii()).ok())
            .map(|entry| entry.end())
            .filter(|end| *end <= output_len)
            .max();
        match tail_end {
            Some(end) => Ok(end),
            None if start == 0 => Ok(0),
            None => Ok(self
                .read_index(session_id, dir)?
                .iter()
                .map(IndexEntry::end)
                .filter(|end| *end <= output_len)
                .max()
                .unwrap_or(0)),
        }
    }

    fn read_index(&self, session_id: &str, dir: &Path) -> Result<Vec<IndexEntry>, StoreError> {
        let path = self.artifact(session_id, dir, INDEX_FILE)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(StoreError::io("opening", path, error)),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|error| StoreError::io("reading", &path, error))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Lines torn by a crashed writer never parse and are skipped.
            if let Ok(entry) = serde_json::from_str::<IndexEntry>(trimmed) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

/// Without final metadata a session is running while its pid is alive and
/// failed otherwise, including when no pid was ever recorded.
fn infer_unfinished_state(pid: u32) -> SessionState {
    if process_alive(pid) {
        SessionState::Running
    } else {
        SessionState::Failed
    }
}

pub fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    let reason = if session_id.is_empty() {
        "empty"
    } else if session_id.contains("..") {
        "contains a parent reference"
    } else if session_id.contains(['/', '\\']) {
        "contains a path separator"
    } else if session_id.contains('\0') {
        "contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidSessionId {
        session_id: session_id.to_string(),
        reason,
    })
}

fn reject_path(session_id: &str, path: PathBuf, resolved: PathBuf) -> StoreError {
    tracing::warn!(
        session_id,
        path = %path.display(),
        resolved = %resolved.display(),
        "store_rejected_path"
    );
    StoreError::SymlinkEscape { path, resolved }
}

struct AppendLock {
    file: File,
}

impl AppendLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = open_private(path, OpenOptions::new().create(true).read(true).write(true))
            .map_err(|error| StoreError::io("opening", path, error))?;
        file.lock_exclusive()
            .map_err(|error| StoreError::io("locking", path, error))?;
        Ok(Self { file })
    }
}

impl Drop for AppendLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_private(path: &Path, options: &mut OpenOptions) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn ends_with_torn_line(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn file_len(path: &Path) -> Result<u64, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(error) => Err(StoreError::io("inspecting", path, error)),
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(StoreError::io("reading", path, error)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let payload = serde_json::to_vec(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    let written = open_private(&tmp, OpenOptions::new().create(true).write(true).truncate(true))
        .and_then(|mut file| {
            file.write_all(&payload)?;
            file.sync_all()
        });
    if let Err(error) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io("writing", tmp, error));
    }
    if let Err(error) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io("replacing", path, error));
    }
    set_private_mode(path, 0o600).map_err(|error| StoreError::io("securing", path, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunResult, SCHEMA_VERSION, TransportMode};
    use tempfile::tempdir;
    use time::Duration;
    use time::macros::datetime;

    const ID: &str = "01J0S111111111111111111111";

    fn start_meta(session_id: &str, pid: u32) -> StartMeta {
        StartMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            session_id: session_id.to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            working_directory: "/tmp".to_string(),
            started_at: datetime!(2026-02-14 10:00:00 UTC),
            retention_seconds: 600,
            transport_mode: TransportMode::Pipe,
            tty_attached: false,
            pid,
        }
    }

    fn finish(store: &SessionStore, session_id: &str) {
        store
            .write_final_meta(&FinalMeta::from_outcome(
                session_id,
                datetime!(2026-02-14 10:01:00 UTC),
                &RunResult::Exited { code: 0 },
            ))
            .expect("final");
    }

    #[test]
    fn append_offsets_are_contiguous() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store.write_start_meta(&start_meta(ID, 0)).expect("meta");

        let now = OffsetDateTime::now_utc();
        let mut expected = 0u64;
        for (index, chunk) in ["abc", "", "de", "fghij"].iter().enumerate() {
            let channel = if index % 2 == 0 {
                OutputChannel::Stdout
            } else {
                OutputChannel::Stderr
            };
            let offset = store
                .append_output(ID, channel, chunk.as_bytes(), now)
                .expect("append");
            assert_eq!(offset, expected);
            expected += chunk.len() as u64;
        }
        assert_eq!(store.output_total(ID).expect("total"), 10);

        let detail = store.get_session(ID).expect("detail");
        assert_eq!(detail.output_bytes, 10);
        assert_eq!(detail.chunk_count, 3);
        assert!(detail.last_chunk_at.is_some());
    }

    #[test]
    fn read_round_trip_reports_eof_only_when_terminal() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store
            .write_start_meta(&start_meta(ID, std::process::id()))
            .expect("meta");
        let now = OffsetDateTime::now_utc();
        store
            .append_output(ID, OutputChannel::Stdout, b"hello ", now)
            .expect("append");
        store
            .append_output(ID, OutputChannel::Stderr, b"world", now)
            .expect("append");

        let live = store.read_output(ID, 0, 11).expect("read");
        assert_eq!(live.next_cursor, 11);
        assert!(!live.eof, "running session must not report eof");
        let bytes: Vec<u8> = live.chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(bytes, b"hello world");
        assert_eq!(live.chunks[1].channel, OutputChannel::Stderr);
        assert_eq!(live.chunks[1].start_cursor, 6);

        finish(&store, ID);
        let done = store.read_output(ID, 0, 11).expect("read");
        assert_eq!(done.chunks, live.chunks);
        assert!(done.eof);
    }

    #[test]
    fn reads_are_idempotent_and_budgeted() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store.write_start_meta(&start_meta(ID, 0)).expect("meta");
        store
            .append_output(ID, OutputChannel::Pty, b"0123456789", OffsetDateTime::now_utc())
            .expect("append");

        let first = store.read_output(ID, 2, 3).expect("read");
        let second = store.read_output(ID, 2, 3).expect("read");
        assert_eq!(first, second);
        assert_eq!(first.chunks.len(), 1);
        assert_eq!(first.chunks[0].data, b"234");
        assert_eq!(first.next_cursor, 5);
        assert!(!first.eof);

        let clamped = store.read_output(ID, 500, 0).expect("read");
        assert!(clamped.chunks.is_empty());
        assert_eq!(clamped.next_cursor, 10);
        // pid 0 without final metadata is inferred failed, hence terminal.
        assert!(clamped.eof);
    }

    #[test]
    fn untrusted_index_tail_is_ignored() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store.write_start_meta(&start_meta(ID, 0)).expect("meta");
        store
            .append_output(ID, OutputChannel::Stdout, b"abc", OffsetDateTime::now_utc())
            .expect("append");

        let session_dir = store.existing_session_dir(ID).expect("dir");
        let mut index = OpenOptions::new()
            .append(true)
            .open(session_dir.join(INDEX_FILE))
            .expect("index");
        writeln!(
            index,
            r#"{{"offset":3,"length":100,"channel":"stdout","timestamp":"2026-02-14T10:00:00Z"}}"#
        )
        .expect("write");
        write!(index, r#"{{"offset":103,"len"#).expect("torn");

        let read = store.read_output(ID, 0, 0).expect("read");
        assert_eq!(read.next_cursor, 3);
        assert_eq!(read.chunks.len(), 1);
        assert_eq!(store.output_total(ID).expect("total"), 3);

        let offset = store
            .append_output(ID, OutputChannel::Stderr, b"de", OffsetDateTime::now_utc())
            .expect("append after torn line");
        assert_eq!(offset, 3);
        let read = store.read_output(ID, 0, 0).expect("read");
        assert_eq!(read.next_cursor, 5);
        assert_eq!(read.chunks.len(), 2);
        assert_eq!(read.chunks[1].data, b"de");
    }

    #[test]
    fn eof_waits_for_tail_appended_before_final_meta() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store
            .write_start_meta(&start_meta(ID, std::process::id()))
            .expect("meta");
        let now = OffsetDateTime::now_utc();
        store
            .append_output(ID, OutputChannel::Stdout, b"one", now)
            .expect("append");

        let first = store.read_output(ID, 0, 0).expect("read");
        assert_eq!(first.next_cursor, 3);
        assert!(!first.eof);

        store
            .append_output(ID, OutputChannel::Stdout, b"two", now)
            .expect("append");
        finish(&store, ID);

        let partial = store.read_output(ID, first.next_cursor, 2).expect("read");
        assert_eq!(partial.next_cursor, 5);
        assert!(!partial.eof, "unread tail remains");
        let last = store.read_output(ID, partial.next_cursor, 0).expect("read");
        assert_eq!(last.chunks[0].data, b"o");
        assert_eq!(last.next_cursor, 6);
        assert!(last.eof);
    }

    #[test]
    fn concurrent_appends_keep_index_contiguous() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        const WRITERS: usize = 4;
        const CHUNKS: usize = 25;

        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store.write_start_meta(&start_meta(ID, 0)).expect("meta");

        let barrier = Arc::new(Barrier::new(WRITERS));
        let handles: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let store = SessionStore::open(dir.path()).expect("store clone");
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut written = Vec::new();
                    for chunk in 0..CHUNKS {
                        let data = format!("w{writer}c{chunk}|").repeat(writer + 1).into_bytes();
                        let now = OffsetDateTime::now_utc();
                        let offset = store
                            .append_output(ID, OutputChannel::Stdout, &data, now)
                            .expect("append");
                        written.push((offset, data));
                    }
                    written
                })
            })
            .collect();
        let mut written: Vec<(u64, Vec<u8>)> = handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("join"))
            .collect();
        written.sort_by_key(|(offset, _)| *offset);

        let session_dir = store.existing_session_dir(ID).expect("dir");
        let entries = store.read_index(ID, &session_dir).expect("index");
        assert_eq!(entries.len(), WRITERS * CHUNKS);
        let mut expected = 0u64;
        for (entry, (offset, data)) in entries.iter().zip(&written) {
            assert_eq!(entry.offset, expected);
            assert_eq!(entry.offset, *offset);
            assert_eq!(entry.length, data.len() as u64);
            expected = entry.end();
        }
        let output = fs::read(session_dir.join(OUTPUT_FILE)).expect("output");
        assert_eq!(output.len() as u64, expected);
        for (offset, data) in &written {
            let start = *offset as usize;
            assert_eq!(&output[start..start + data.len()], data.as_slice());
        }
    }

    #[test]
    fn orphaned_output_bytes_are_dropped_on_next_append() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store.write_start_meta(&start_meta(ID, 0)).expect("meta");
        store
            .append_output(ID, OutputChannel::Stdout, b"abc", OffsetDateTime::now_utc())
            .expect("append");

        // A writer that died between the data write and the index record.
        let session_dir = store.existing_session_dir(ID).expect("dir");
        let mut output = OpenOptions::new()
            .append(true)
            .open(session_dir.join(OUTPUT_FILE))
            .expect("output");
        output.write_all(b"xyz").expect("orphan");
        drop(output);

        let offset = store
            .append_output(ID, OutputChannel::Stdout, b"def", OffsetDateTime::now_utc())
            .expect("append");
        assert_eq!(offset, 3);
        let read = store.read_output(ID, 0, 0).expect("read");
        let bytes: Vec<u8> = read.chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(bytes, b"abcdef");
        assert_eq!(read.next_cursor, 6);
        assert_eq!(
            fs::metadata(session_dir.join(OUTPUT_FILE)).expect("len").len(),
            6
        );
    }

    #[test]
    fn inference_without_final_meta_uses_pid_liveness() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store
            .write_start_meta(&start_meta(ID, std::process::id()))
            .expect("meta");
        assert_eq!(
            store.get_session(ID).expect("detail").summary.state,
            SessionState::Running
        );

        let other = "01J0S222222222222222222222";
        store.write_start_meta(&start_meta(other, 0)).expect("meta");
        assert_eq!(
            store.get_session(other).expect("detail").summary.state,
            SessionState::Failed
        );

        finish(&store, other);
        let detail = store.get_session(other).expect("detail");
        assert_eq!(detail.summary.state, SessionState::Exited);
        assert_eq!(detail.exit_code, Some(0));
        assert!(detail.summary.ended_at.is_some());
    }

    #[test]
    fn missing_session_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        let error = store.get_session(ID).expect_err("missing");
        assert!(error.is_not_found());
        let error = store.read_output(ID, 0, 0).expect_err("missing");
        assert!(error.is_not_found());
        assert!(!store.has_session_metadata(ID).expect("has"));

        store.ensure_session_dir(ID).expect("dir");
        assert!(store.get_session(ID).expect_err("no meta").is_not_found());
    }

    #[test]
    fn traversal_ids_are_rejected_before_touching_disk() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        for bad in ["", "..", "../escape", "a/b", "a\\b", "x..y"] {
            let error = store.ensure_session_dir(bad).expect_err(bad);
            assert!(error.is_invalid_session_id(), "{bad}: {error}");
        }
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn list_filters_sorts_and_limits() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        let ids = [
            "01J0SAAAAAAAAAAAAAAAAAAAAA",
            "01J0SBBBBBBBBBBBBBBBBBBBBB",
            "01J0TCCCCCCCCCCCCCCCCCCCCC",
        ];
        for (index, id) in ids.iter().enumerate() {
            let mut meta = start_meta(id, 0);
            meta.started_at += Duration::minutes(index as i64);
            store.write_start_meta(&meta).expect("meta");
        }
        finish(&store, ids[1]);
        fs::create_dir(store.sessions_root().join("garbage")).expect("garbage");
        fs::write(store.sessions_root().join("stray.txt"), b"x").expect("stray");

        let all = store
            .list_sessions(&SessionFilter::default(), 0)
            .expect("list");
        assert_eq!(all.total, 3);
        let order: Vec<&str> = all.sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(order, vec![ids[2], ids[1], ids[0]]);

        let prefixed = store
            .list_sessions(
                &SessionFilter {
                    id_prefix: Some("01J0S".to_string()),
                    state: None,
                },
                1,
            )
            .expect("list");
        assert_eq!(prefixed.total, 2);
        assert_eq!(prefixed.sessions.len(), 1);
        assert_eq!(prefixed.sessions[0].session_id, ids[1]);

        let exited = store
            .list_sessions(
                &SessionFilter {
                    id_prefix: None,
                    state: Some(SessionState::Exited),
                },
                0,
            )
            .expect("list");
        assert_eq!(exited.total, 1);
        assert_eq!(exited.sessions[0].session_id, ids[1]);
    }

    #[cfg(unix)]
    #[test]
    fn metadata_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("store");
        store.write_start_meta(&start_meta(ID, 0)).expect("meta");
        store
            .append_output(ID, OutputChannel::Stdout, b"x", OffsetDateTime::now_utc())
            .expect("append");
        let session_dir = store.existing_session_dir(ID).expect("dir");
        let mode = |path: PathBuf| fs::metadata(path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode(session_dir.clone()), 0o700);
        assert_eq!(mode(session_dir.join(META_FILE)), 0o600);
        assert_eq!(mode(session_dir.join(OUTPUT_FILE)), 0o600);
        assert_eq!(mode(session_dir.join(INDEX_FILE)), 0o600);
    }

    #[cfg(unix)]
    mod symlinks {
        use super::*;
        use std::os::unix::fs::symlink;

        fn session_dir(store: &SessionStore) -> PathBuf {
            store.ensure_session_dir(ID).expect("dir")
        }

        #[test]
        fn symlinked_session_dir_outside_root_is_rejected() {
            let dir = tempdir().expect("tempdir");
            let outside = tempdir().expect("outside");
            let store = SessionStore::open(dir.path()).expect("store");
            symlink(outside.path(), store.sessions_root().join(ID)).expect("symlink");

            assert!(store.ensure_session_dir(ID).expect_err("dir").is_symlink_escape());
            assert!(
                store
                    .write_start_meta(&start_meta(ID, 0))
                    .expect_err("meta")
                    .is_symlink_escape()
            );
            assert!(
                store
                    .append_output(ID, OutputChannel::Stdout, b"x", OffsetDateTime::now_utc())
                    .expect_err("append")
                    .is_symlink_escape()
            );
            assert!(store.read_output(ID, 0, 0).expect_err("read").is_symlink_escape());
            assert!(store.get_session(ID).expect_err("get").is_symlink_escape());
            assert!(store.has_session_metadata(ID).expect_err("has").is_symlink_escape());
            assert_eq!(fs::read_dir(outside.path()).expect("read").count(), 0);
        }

        #[test]
        fn dangling_session_dir_link_is_not_created() {
            let dir = tempdir().expect("tempdir");
            let outside = tempdir().expect("outside");
            let store = SessionStore::open(dir.path()).expect("store");
            let target = outside.path().join("later");
            symlink(&target, store.sessions_root().join(ID)).expect("symlink");

            assert!(
                store
                    .write_start_meta(&start_meta(ID, 0))
                    .expect_err("meta")
                    .is_symlink_escape()
            );
            assert!(!target.exists());
        }

        #[test]
        fn artifact_links_outside_session_are_rejected() {
            for name in [META_FILE, FINAL_FILE, LOCK_FILE, OUTPUT_FILE, INDEX_FILE] {
                let dir = tempdir().expect("tempdir");
                let outside = tempdir().expect("outside");
                let store = SessionStore::open(dir.path()).expect("store");
                let session = session_dir(&store);
                let target = outside.path().join("target");
                fs::write(&target, b"{}").expect("target");
                symlink(&target, session.join(name)).expect("symlink");

                let error = match name {
                    META_FILE => store.write_start_meta(&start_meta(ID, 0)).expect_err(name),
                    FINAL_FILE => store
                        .write_final_meta(&FinalMeta::from_outcome(
                            ID,
                            OffsetDateTime::now_utc(),
                            &RunResult::Exited { code: 0 },
                        ))
                        .expect_err(name),
                    _ => store
                        .append_output(ID, OutputChannel::Stdout, b"x", OffsetDateTime::now_utc())
                        .expect_err(name),
                };
                assert!(error.is_symlink_escape(), "{name}: {error}");
                assert_eq!(fs::read(&target).expect("target"), b"{}", "{name}");
            }
        }

        #[test]
        fn dangling_output_link_is_rejected_without_creating_target() {
            let dir = tempdir().expect("tempdir");
            let outside = tempdir().expect("outside");
            let store = SessionStore::open(dir.path()).expect("store");
            let session = session_dir(&store);
            let target = outside.path().join("output.bin");
            symlink(&target, session.join(OUTPUT_FILE)).expect("symlink");

            let error = store
                .append_output(ID, OutputChannel::Stdout, b"x", OffsetDateTime::now_utc())
                .expect_err("append");
            assert!(error.is_symlink_escape());
            assert!(!target.exists());
        }

        #[test]
        fn index_link_outside_session_blocks_reads() {
            let dir = tempdir().expect("tempdir");
            let outside = tempdir().expect("outside");
            let store = SessionStore::open(dir.path()).expect("store");
            store.write_start_meta(&start_meta(ID, 0)).expect("meta");
            let session = session_dir(&store);
            let target = outside.path().join("index.jsonl");
            fs::write(&target, b"").expect("target");
            symlink(&target, session.join(INDEX_FILE)).expect("symlink");

            assert!(store.read_output(ID, 0, 0).expect_err("read").is_symlink_escape());
            assert!(store.get_session(ID).expect_err("get").is_symlink_escape());
        }

        #[test]
        fn links_within_session_dir_are_allowed() {
            let dir = tempdir().expect("tempdir");
            let store = SessionStore::open(dir.path()).expect("store");
            let session = session_dir(&store);
            symlink("real-output.bin", session.join(OUTPUT_FILE)).expect("symlink");

            store.write_start_meta(&start_meta(ID, 0)).expect("meta");
            store
                .append_output(ID, OutputChannel::Stdout, b"inside", OffsetDateTime::now_utc())
                .expect("append");
            assert_eq!(
                fs::read(session.join("real-output.bin")).expect("real"),
                b"inside"
            );
            let read = store.read_output(ID, 0, 0).expect("read");
            assert_eq!(read.chunks[0].data, b"inside");
        }

        #[test]
        fn symlinked_entries_are_unlinked_not_followed_on_removal() {
            let dir = tempdir().expect("tempdir");
            let outside = tempdir().expect("outside");
            let store = SessionStore::open(dir.path()).expect("store");
            fs::write(outside.path().join("keep.txt"), b"keep").expect("keep");
            symlink(outside.path(), store.sessions_root().join(ID)).expect("symlink");

            store.remove_session(ID).expect("remove");
            assert!(!store.sessions_root().join(ID).exists());
            assert!(outside.path().join("keep.txt").exists());
        }
    }
}
