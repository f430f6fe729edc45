use crate::domain::DEFAULT_RETENTION;
use crate::infra::{SessionStore, StoreError};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use time::OffsetDateTime;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("retention ttl must be positive")]
    NonPositiveTtl,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAction {
    Removed,
    Skipped,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepReason {
    Expired,
    UnreadableExpired,
    NotExpired,
    ActiveSession,
    UnreadableNotExpired,
    RemoveFailed,
    InspectFailed,
}

impl SweepReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::UnreadableExpired => "unreadable_expired",
            Self::NotExpired => "not_expired",
            Self::ActiveSession => "active_session",
            Self::UnreadableNotExpired => "unreadable_not_expired",
            Self::RemoveFailed => "remove_failed",
            Self::InspectFailed => "inspect_failed",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SweepDecision {
    pub session_id: String,
    pub action: SweepAction,
    pub reason: SweepReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SweepResult {
    pub checked: usize,
    pub removed: usize,
    pub decisions: Vec<SweepDecision>,
}

pub fn sweep(
    store: &SessionStore,
    ttl: Duration,
    keep: Option<&str>,
) -> Result<SweepResult, SweepError> {
    sweep_at(store, ttl, OffsetDateTime::now_utc(), keep)
}

/// Removes every finished session whose retention has lapsed at `now`.
///
/// Sessions still starting or running survive regardless of age. Sessions
/// whose metadata cannot be read age from their newest file modification and
/// always use the default retention. `keep` names a session the caller is
/// recording right now; it is treated as active whatever its metadata says.
pub fn sweep_at(
    store: &SessionStore,
    ttl: Duration,
    now: OffsetDateTime,
    keep: Option<&str>,
) -> Result<SweepResult, SweepError> {
    if ttl.is_zero() {
        return Err(SweepError::NonPositiveTtl);
    }

    let mut result = SweepResult::default();
    for session_id in store.list_session_ids()? {
        result.checked += 1;
        let decision = if keep == Some(session_id.as_str()) {
            Ok((SweepAction::Skipped, SweepReason::ActiveSession))
        } else {
            decide(store, &session_id, ttl, now)
        };
        let decision = match decision {
            Ok((SweepAction::Removed, reason)) => match store.remove_session(&session_id) {
                Ok(()) => {
                    result.removed += 1;
                    SweepDecision {
                        session_id,
                        action: SweepAction::Removed,
                        reason,
                        error: None,
                    }
                }
                Err(error) => SweepDecision {
                    session_id,
                    action: SweepAction::Error,
                    reason: SweepReason::RemoveFailed,
                    error: Some(error.to_string()),
                },
            },
            Ok((action, reason)) => SweepDecision {
                session_id,
                action,
                reason,
                error: None,
            },
            Err(error) if error.is_not_found() => {
                // Removed by a concurrent sweep between listing and inspection.
                result.checked -= 1;
                continue;
            }
            Err(error) => SweepDecision {
                session_id,
                action: SweepAction::Error,
                reason: SweepReason::InspectFailed,
                error: Some(error.to_string()),
            },
        };

        log_decision(&decision);
        result.decisions.push(decision);
    }
    Ok(result)
}

fn decide(
    store: &SessionStore,
    session_id: &str,
    ttl: Duration,
    now: OffsetDateTime,
) -> Result<(SweepAction, SweepReason), StoreError> {
    let detail = match store.get_session(session_id) {
        Ok(detail) => detail,
        Err(error) if error.is_symlink_escape() => return Err(error),
        Err(_) => {
            let dir = store.existing_session_dir(session_id)?;
            let last_touched = last_modified(&dir);
            return Ok(if has_lapsed(last_touched, ttl, now) {
                (SweepAction::Removed, SweepReason::UnreadableExpired)
            } else {
                (SweepAction::Skipped, SweepReason::UnreadableNotExpired)
            });
        }
    };

    let summary = &detail.summary;
    let effective_ttl = if summary.retention_seconds > 0 {
        Duration::from_secs(summary.retention_seconds)
    } else {
        ttl
    };
    if summary.state.is_active() {
        return Ok((SweepAction::Skipped, SweepReason::ActiveSession));
    }
    let anchor = summary.ended_at.unwrap_or(summary.started_at);
    if !has_lapsed(anchor, effective_ttl, now) {
        return Ok((SweepAction::Skipped, SweepReason::NotExpired));
    }
    Ok((SweepAction::Removed, SweepReason::Expired))
}

/// An expiry past the end of the representable calendar never lapses.
fn has_lapsed(anchor: OffsetDateTime, ttl: Duration, now: OffsetDateTime) -> bool {
    time::Duration::try_from(ttl)
        .ok()
        .and_then(|ttl| anchor.checked_add(ttl))
        .is_some_and(|expires_at| now >= expires_at)
}

/// Newest modification time of the directory and its immediate artifacts.
fn last_modified(dir: &Path) -> OffsetDateTime {
    WalkDir::new(dir)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter_map(|meta| meta.modified().ok())
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into()
}

fn log_decision(decision: &SweepDecision) {
    let action = match decision.action {
        SweepAction::Removed => "removed",
        SweepAction::Skipped => "skipped",
        SweepAction::Error => "error",
    };
    match &decision.error {
        Some(error) => tracing::warn!(
            session_id = %decision.session_id,
            cleanup_result = action,
            reason = decision.reason.label(),
            error = %error,
            "cleanup_result"
        ),
        None => tracing::info!(
            session_id = %decision.session_id,
            cleanup_result = action,
            reason = decision.reason.label(),
            "cleanup_result"
        ),
    }
}

/// Sweep that only logs its failures; `ttl` falls back to the default retention.
pub fn sweep_best_effort(
    store: &SessionStore,
    ttl: Option<Duration>,
    keep: Option<&str>,
) -> Option<SweepResult> {
    match sweep(store, ttl.unwrap_or(DEFAULT_RETENTION), keep) {
        Ok(result) => {
            tracing::info!(
                checked = result.checked,
                removed = result.removed,
                "sweep_finished"
            );
            Some(result)
        }
        Err(error) => {
            tracing::warn!(error = %error, "sweep_failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        FinalMeta, RunResult, SCHEMA_VERSION, SessionState, StartMeta, TransportMode,
    };
    use std::fs;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).expect("open");
        (dir, store)
    }

    fn record(
        store: &SessionStore,
        session_id: &str,
        started_at: OffsetDateTime,
        retention_seconds: u64,
        pid: u32,
        ended_at: Option<OffsetDateTime>,
    ) {
        store.ensure_session_dir(session_id).expect("dir");
        store
            .write_start_meta(&StartMeta {
                schema_version: SCHEMA_VERSION.to_string(),
                session_id: session_id.to_string(),
                command: vec!["true".to_string()],
                working_directory: "/".to_string(),
                started_at,
                retention_seconds,
                transport_mode: TransportMode::Pipe,
                tty_attached: false,
                pid,
            })
            .expect("meta");
        if let Some(ended_at) = ended_at {
            store
                .write_final_meta(&FinalMeta::from_outcome(
                    session_id,
                    ended_at,
                    &RunResult::Exited { code: 0 },
                ))
                .expect("final");
        }
    }

    fn start() -> OffsetDateTime {
        time::macros::datetime!(2026-03-01 12:00 UTC)
    }

    #[test]
    fn override_expiry_removes_session() {
        let (_dir, store) = store();
        let ended = start() + Duration::from_secs(5);
        record(&store, "a", start(), 600, 0, Some(ended));

        let result = sweep_at(
            &store,
            Duration::from_secs(1800),
            ended + Duration::from_secs(601),
            None,
        )
        .expect("sweep");
        assert_eq!(result.checked, 1);
        assert_eq!(result.removed, 1);
        assert_eq!(result.decisions[0].reason, SweepReason::Expired);
        assert!(!store.sessions_root().join("a").exists());
    }

    #[test]
    fn longer_override_outlives_default_ttl() {
        let (_dir, store) = store();
        let ended = start() + Duration::from_secs(5);
        record(&store, "a", start(), 7200, 0, Some(ended));

        let result = sweep_at(
            &store,
            Duration::from_secs(1800),
            ended + Duration::from_secs(3600),
            None,
        )
        .expect("sweep");
        assert_eq!((result.checked, result.removed), (1, 0));
        assert_eq!(result.decisions[0].reason, SweepReason::NotExpired);
        assert!(store.sessions_root().join("a").exists());
    }

    #[test]
    fn default_ttl_applies_without_override() {
        let (_dir, store) = store();
        let ended = start() + Duration::from_secs(5);
        record(&store, "a", start(), 0, 0, Some(ended));

        let ttl = Duration::from_secs(60);
        let kept = sweep_at(&store, ttl, ended + Duration::from_secs(59), None).expect("sweep");
        assert_eq!(kept.removed, 0);
        let removed = sweep_at(&store, ttl, ended + ttl, None).expect("sweep");
        assert_eq!(removed.removed, 1);
    }

    #[test]
    fn running_session_is_never_removed() {
        let (_dir, store) = store();
        record(&store, "live", start(), 1, std::process::id(), None);
        assert_eq!(
            store.get_session("live").expect("detail").summary.state,
            SessionState::Running
        );

        let result = sweep_at(
            &store,
            Duration::from_secs(1),
            start() + Duration::from_secs(365 * 24 * 3600),
            None,
        )
        .expect("sweep");
        assert_eq!((result.checked, result.removed), (1, 0));
        assert_eq!(result.decisions[0].action, SweepAction::Skipped);
        assert_eq!(result.decisions[0].reason, SweepReason::ActiveSession);
    }

    #[test]
    fn vanished_process_ages_from_start_time() {
        let (_dir, store) = store();
        record(&store, "crashed", start(), 60, 0, None);

        let now = start() + Duration::from_secs(61);
        let result = sweep_at(&store, Duration::from_secs(3600), now, None).expect("sweep");
        assert_eq!(result.removed, 1);
    }

    #[test]
    fn unreadable_session_ages_from_modification_time() {
        let (_dir, store) = store();
        let dir = store.ensure_session_dir("orphan").expect("dir");
        fs::write(dir.join("meta.json"), b"{not json").expect("write");
        let now = OffsetDateTime::now_utc();

        let fresh = sweep_at(&store, Duration::from_secs(3600), now, None).expect("sweep");
        assert_eq!(fresh.removed, 0);
        assert_eq!(fresh.decisions[0].reason, SweepReason::UnreadableNotExpired);

        let later = now + Duration::from_secs(2 * 3600);
        let stale = sweep_at(&store, Duration::from_secs(3600), later, None).expect("sweep");
        assert_eq!((stale.checked, stale.removed), (1, 1));
        assert_eq!(stale.decisions[0].reason, SweepReason::UnreadableExpired);
        assert!(!dir.exists());
    }

    #[test]
    fn kept_session_survives_even_when_expired() {
        let (_dir, store) = store();
        record(&store, "current", start(), 1, 0, None);
        record(&store, "old", start(), 1, 0, None);

        let result = sweep_at(
            &store,
            Duration::from_secs(1),
            start() + Duration::from_secs(60),
            Some("current"),
        )
        .expect("sweep");
        assert_eq!((result.checked, result.removed), (2, 1));
        assert!(store.sessions_root().join("current").exists());
        assert!(!store.sessions_root().join("old").exists());
    }

    #[test]
    fn out_of_range_expiry_never_lapses() {
        let (_dir, store) = store();
        let ended = start() + Duration::from_secs(5);
        record(&store, "forever", start(), 86_400_000_000_000, 0, Some(ended));
        record(&store, "old", start(), 60, 0, Some(ended));
        let dir = store.ensure_session_dir("orphan").expect("dir");
        fs::write(dir.join("meta.json"), b"{not json").expect("write");

        let now = ended + Duration::from_secs(3600);
        let result = sweep_at(&store, Duration::MAX, now, None).expect("sweep");
        assert_eq!((result.checked, result.removed), (3, 1));
        assert!(store.sessions_root().join("forever").exists());
        assert!(store.sessions_root().join("orphan").exists());
        assert!(!store.sessions_root().join("old").exists());

        assert!(sweep_best_effort(&store, None, None).is_some());
        assert!(store.sessions_root().join("forever").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_removal_does_not_stop_the_sweep() {
        use std::os::unix::fs::PermissionsExt;

        // Directory permissions do not bind the superuser.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let (_dir, store) = store();
        let ended = start() + Duration::from_secs(5);
        record(&store, "a-locked", start(), 60, 0, Some(ended));
        record(&store, "b-old", start(), 60, 0, Some(ended));
        let locked = store.sessions_root().join("a-locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).expect("chmod");

        let now = ended + Duration::from_secs(3600);
        let result = sweep_at(&store, Duration::from_secs(60), now, None);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).expect("restore");
        let result = result.expect("sweep");

        assert_eq!((result.checked, result.removed), (2, 1));
        let failed = result
            .decisions
            .iter()
            .find(|decision| decision.session_id == "a-locked")
            .expect("locked decision");
        assert_eq!(failed.action, SweepAction::Error);
        assert_eq!(failed.reason, SweepReason::RemoveFailed);
        assert!(failed.error.is_some());
        assert!(locked.exists());
        assert!(!store.sessions_root().join("b-old").exists());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            sweep_at(&store, Duration::ZERO, start(), None),
            Err(SweepError::NonPositiveTtl)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_entries_are_not_swept() {
        let (_dir, store) = store();
        let outside = tempfile::tempdir().expect("outside");
        fs::write(outside.path().join("keep"), b"x").expect("write");
        std::os::unix::fs::symlink(outside.path(), store.sessions_root().join("link"))
            .expect("symlink");

        let result = sweep_at(
            &store,
            Duration::from_secs(1),
            start() + Duration::from_secs(365 * 24 * 3600),
            None,
        )
        .expect("sweep");
        assert_eq!(result.checked, 0);
        assert!(outside.path().join("keep").exists());
    }
}
