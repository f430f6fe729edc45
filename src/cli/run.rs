use crate::cli::RunArgs;
use crate::domain::{
    FinalMeta, HostOs, RetentionError, RunResult, SCHEMA_VERSION, SessionId, SessionIdError,
    StartMeta, TransportMode, format_duration, select_transport_mode, validate_retention,
};
use crate::infra::{
    CancellationToken, ResolveStateRootError, RunRequest, SessionSinks, SessionStore,
    StartHookError, StoreError, resolve_state_root, sweep_best_effort, transport_for,
};
use crate::logging::{InitLoggingError, init_logging};
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::thread;
use thiserror::Error;
use time::OffsetDateTime;

const MAX_SESSION_ID_ATTEMPTS: u32 = 5;

/// Failures before or around a run. A child that exits non-zero or dies from a
/// signal is not an error; it is reported through [`RunReport`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    InvalidRetention(#[from] RetentionError),

    #[error("resolve state root: {0}")]
    ResolveStateRoot(#[from] ResolveStateRootError),

    #[error("init state store: {0}")]
    InitStore(#[source] StoreError),

    #[error("init logger: {0}")]
    InitLogging(#[from] InitLoggingError),

    #[error("resolve working directory: {0}")]
    WorkingDir(#[source] io::Error),

    #[error("invalid session id: {session_id} ({source})")]
    InvalidSessionId {
        session_id: String,
        #[source]
        source: SessionIdError,
    },

    #[error("session id already exists: {0}")]
    SessionIdExists(String),

    #[error("check session metadata: {0}")]
    CheckSessionMetadata(#[source] StoreError),

    #[error("generate session id: {0}")]
    GenerateSessionId(#[from] SessionIdError),

    #[error("generate session id: too many collisions after {0} attempts")]
    SessionIdCollisions(u32),

    #[error("prepare session directory: {0}")]
    PrepareSessionDir(#[source] StoreError),

    #[error("write metadata: {0}")]
    WriteMeta(#[source] StoreError),

    #[error("write final metadata: {0}")]
    WriteFinal(#[source] StoreError),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidRetention(_)
            | Self::InvalidSessionId { .. }
            | Self::SessionIdExists(_) => 2,
            _ => 1,
        }
    }
}

/// Host facts a run depends on, captured once up front.
#[derive(Clone)]
pub struct RunEnvironment {
    pub working_dir: PathBuf,
    pub tty_attached: bool,
    pub host_os: HostOs,
    pub mirror_to_host: bool,
    pub cancel: CancellationToken,
}

impl RunEnvironment {
    pub fn detect() -> Result<Self, RunError> {
        let working_dir = std::env::current_dir().map_err(RunError::WorkingDir)?;
        Ok(Self {
            working_dir,
            tty_attached: io::stdin().is_terminal() && io::stdout().is_terminal(),
            host_os: HostOs::current(),
            mirror_to_host: true,
            cancel: CancellationToken::new(),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunReport {
    pub session_id: String,
    pub transport_mode: TransportMode,
    pub result: RunResult,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.result.process_exit_code()
    }
}

/// `derun run`: resolves the store, records one session and returns the
/// process exit status.
pub fn execute_run(args: &RunArgs) -> Result<i32, RunError> {
    validate_retention(args.retention)?;
    let state_root = resolve_state_root()?;
    let store = SessionStore::open(&state_root).map_err(RunError::InitStore)?;
    let _log_guard = init_logging(&state_root)?;
    let env = RunEnvironment::detect()?;

    let report = run_session(&store, args, &env)?;
    if let RunResult::Failed { error } = &report.result {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "run command: {error}");
    }
    Ok(report.exit_code())
}

pub fn run_session(
    store: &SessionStore,
    args: &RunArgs,
    env: &RunEnvironment,
) -> Result<RunReport, RunError> {
    let retention_seconds = validate_retention(args.retention)?;
    let session_id = match args.session_id.as_deref() {
        Some(explicit) => claim_session_id(store, explicit)?,
        None => allocate_session_id(store)?,
    };
    store
        .ensure_session_dir(&session_id)
        .map_err(RunError::PrepareSessionDir)?;

    let transport_mode = select_transport_mode(env.tty_attached, env.host_os);
    let mut meta = StartMeta {
        schema_version: SCHEMA_VERSION.to_string(),
        session_id: session_id.clone(),
        command: args.command.clone(),
        working_directory: env.working_dir.display().to_string(),
        started_at: OffsetDateTime::now_utc(),
        retention_seconds,
        transport_mode,
        tty_attached: env.tty_attached,
        pid: 0,
    };
    store.write_start_meta(&meta).map_err(RunError::WriteMeta)?;

    let sweeper = {
        let store = store.clone();
        let keep = session_id.clone();
        let ttl = args.retention;
        thread::spawn(move || {
            sweep_best_effort(&store, Some(ttl), Some(keep.as_str()));
        })
    };

    tracing::info!(
        session_id = %session_id,
        transport_mode = transport_mode.label(),
        tty_attached = env.tty_attached,
        retention = %format_duration(args.retention),
        state_transition = "starting->running",
        "state_transition"
    );

    let sinks = SessionSinks::new(store.clone(), session_id.clone(), env.mirror_to_host);
    let mut on_start = |pid: u32| -> Result<(), StartHookError> {
        meta.pid = pid;
        store.write_start_meta(&meta)?;
        Ok(())
    };
    let outcome = transport_for(transport_mode).run(
        &RunRequest {
            command: &args.command,
            working_dir: &env.working_dir,
            cancel: &env.cancel,
        },
        &mut on_start,
        &sinks,
    );
    let result = match outcome {
        Ok(exit) => exit.into_run_result(),
        Err(error) => RunResult::Failed {
            error: error.to_string(),
        },
    };
    log_terminal_transition(&session_id, &result);

    let _ = sweeper.join();
    let final_meta = FinalMeta::from_outcome(&session_id, OffsetDateTime::now_utc(), &result);
    store
        .write_final_meta(&final_meta)
        .map_err(RunError::WriteFinal)?;

    Ok(RunReport {
        session_id,
        transport_mode,
        result,
    })
}

fn claim_session_id(store: &SessionStore, session_id: &str) -> Result<String, RunError> {
    if let Err(source) = SessionId::parse(session_id) {
        tracing::warn!(session_id, reason = "invalid_session_id", "session_id_rejected");
        return Err(RunError::InvalidSessionId {
            session_id: session_id.to_string(),
            source,
        });
    }
    match store.has_session_metadata(session_id) {
        Ok(false) => Ok(session_id.to_string()),
        Ok(true) => {
            tracing::warn!(session_id, reason = "metadata_exists", "session_id_rejected");
            Err(RunError::SessionIdExists(session_id.to_string()))
        }
        Err(error) => Err(RunError::CheckSessionMetadata(error)),
    }
}

fn allocate_session_id(store: &SessionStore) -> Result<String, RunError> {
    for attempt in 1..=MAX_SESSION_ID_ATTEMPTS {
        let session_id = SessionId::generate(OffsetDateTime::now_utc())?;
        let taken = store
            .has_session_metadata(session_id.as_str())
            .map_err(RunError::CheckSessionMetadata)?;
        if !taken {
            return Ok(session_id.into_string());
        }
        tracing::warn!(session_id = %session_id, attempt, "session_id_collision");
    }
    Err(RunError::SessionIdCollisions(MAX_SESSION_ID_ATTEMPTS))
}

fn log_terminal_transition(session_id: &str, result: &RunResult) {
    match result {
        RunResult::Exited { code } => tracing::info!(
            session_id,
            exit_code = code,
            state_transition = "running->exited",
            "state_transition"
        ),
        RunResult::Signaled { name, number } => tracing::info!(
            session_id,
            signal = %name,
            signal_number = number,
            state_transition = "running->signaled",
            "state_transition"
        ),
        RunResult::Failed { error } => tracing::warn!(
            session_id,
            error = %error,
            state_transition = "running->failed",
            "state_transition"
        ),
    }
}
