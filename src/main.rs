mod cli;
mod domain;
mod infra;
mod logging;
mod mcp;

use crate::cli::{CliInvocation, McpCommandError, RunError, execute_mcp, execute_run, usage};
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Mcp(#[from] McpCommandError),
}

impl MainError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Run(error) => error.exit_code(),
            Self::Mcp(error) => error.exit_code(),
        }
    }
}

fn main() {
    match run_main() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            std::process::exit(error.exit_code());
        }
    }
}

fn run_main() -> Result<i32, MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match crate::cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = writeln!(err);
            let _ = write!(err, "{}", usage());
            return Ok(2);
        }
    };

    match invocation {
        CliInvocation::PrintHelp => {
            let mut out = io::stdout().lock();
            let _ = write!(out, "{}", usage());
            Ok(0)
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        CliInvocation::Run(args) => Ok(execute_run(&args)?),
        CliInvocation::Mcp => {
            execute_mcp()?;
            Ok(0)
        }
    }
}
