mod mcp;
mod run;

pub use mcp::*;
pub use run::*;

use crate::domain::{
    DEFAULT_RETENTION, DurationParseError, RetentionError, format_duration, parse_duration,
    validate_retention,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Run(RunArgs),
    Mcp,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunArgs {
    pub session_id: Option<String>,
    /// Whole seconds, validated positive.
    pub retention: Duration,
    pub command: Vec<String>,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CliParseError {
    #[error("missing command")]
    MissingSubcommand,

    #[error("unknown command: {0}")]
    UnknownSubcommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("invalid value for {flag}: {source}")]
    InvalidDuration {
        flag: String,
        #[source]
        source: DurationParseError,
    },

    #[error(transparent)]
    InvalidRetention(#[from] RetentionError),

    #[error("run command requires target command")]
    MissingTargetCommand,

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if own_args(args).any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if own_args(args).any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut iter = args.iter().skip(1);
    let Some(subcommand) = iter.next() else {
        return Err(CliParseError::MissingSubcommand);
    };

    match subcommand.as_str() {
        "run" => parse_run(iter.cloned().collect()).map(CliInvocation::Run),
        "mcp" => {
            if let Some(arg) = iter.next() {
                if arg.starts_with('-') {
                    return Err(CliParseError::UnknownFlag(arg.to_string()));
                }
                return Err(CliParseError::UnexpectedArgument(arg.to_string()));
            }
            Ok(CliInvocation::Mcp)
        }
        other => Err(CliParseError::UnknownSubcommand(other.to_string())),
    }
}

/// `run` flags stop at `--` or at the first positional argument, which starts
/// the target command.
fn parse_run(args: Vec<String>) -> Result<RunArgs, CliParseError> {
    let mut session_id: Option<String> = None;
    let mut retention = DEFAULT_RETENTION;
    let mut command = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value)),
            _ => (arg.clone(), None),
        };
        match flag.as_str() {
            "--" => {
                command.extend(args.by_ref());
                break;
            }
            "--session-id" => {
                let value = flag_value(&flag, inline_value, &mut args)?;
                session_id = Some(value);
            }
            "--retention" => {
                let value = flag_value(&flag, inline_value, &mut args)?;
                retention = parse_duration(&value).map_err(|source| {
                    CliParseError::InvalidDuration {
                        flag: flag.clone(),
                        source,
                    }
                })?;
            }
            _ if arg.starts_with('-') => {
                return Err(CliParseError::UnknownFlag(arg));
            }
            _ => {
                command.push(arg);
                command.extend(args.by_ref());
                break;
            }
        }
    }

    validate_retention(retention)?;
    if command.is_empty() {
        return Err(CliParseError::MissingTargetCommand);
    }
    Ok(RunArgs {
        session_id,
        retention,
        command,
    })
}

fn flag_value(
    flag: &str,
    inline_value: Option<&str>,
    args: &mut impl Iterator<Item = String>,
) -> Result<String, CliParseError> {
    match inline_value {
        Some(value) => Ok(value.to_string()),
        None => args
            .next()
            .ok_or_else(|| CliParseError::MissingFlagValue(flag.to_string())),
    }
}

/// Arguments that belong to derun itself: everything before `--` or before
/// the first positional that starts the target command.
fn own_args(args: &[String]) -> impl Iterator<Item = &String> {
    args.iter()
        .skip(1)
        .take_while(|arg| arg.as_str() != "--")
        .take_while(|arg| arg.starts_with('-') || matches!(arg.as_str(), "run" | "mcp"))
}

pub fn usage() -> String {
    format!(
        "{name} - record a command's output for later retrieval\n\nUSAGE:\n  {name} run [--session-id ID] [--retention DURATION] -- COMMAND [ARGS...]\n  {name} mcp\n  {name} --help | --version\n\nRUN FLAGS:\n  --session-id ID        Use an explicit session id (26-character ULID)\n  --retention DURATION   Keep the session this long after it ends (default: {retention})\n                         Whole seconds only, e.g. 30s, 5m, 1h30m, 7d\n\nENV:\n  DERUN_STATE_ROOT   Override the state directory (default: $XDG_STATE_HOME/derun or ~/.local/state/derun)\n",
        name = env!("CARGO_PKG_NAME"),
        retention = format_duration(DEFAULT_RETENTION),
    )
}
