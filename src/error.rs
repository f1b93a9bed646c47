use std::io;

use thiserror::Error;

/// Fatal failure categories that abort a run with a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum RunError {
    #[error("invalid input: {0}")]
    IllegalInput(String),
    #[error("interrupted while waiting: {0}")]
    Interrupted(String),
    #[error("method not resolvable: {0}")]
    MethodNotResolvable(String),
    #[error("insufficient coverage: best candidate {method} scored {score}")]
    InsufficientCoverage { method: String, score: u64 },
    #[error("unexpected debuggee output: {0:?}")]
    UnexpectedDebuggeeOutput(String),
    #[error("failed to spawn {program}: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("no test exercises the target method")]
    NoRelevantTests,
}

impl RunError {
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            RunError::IllegalInput(_) => 3,
            RunError::Interrupted(_) => 5,
            RunError::MethodNotResolvable(_) => 6,
            RunError::InsufficientCoverage { .. } => 7,
            RunError::UnexpectedDebuggeeOutput(_) => 9,
            RunError::SpawnFailure { .. } => 10,
            RunError::NoRelevantTests => 11,
        }
    }
}

/// Exit code for an error chain: categorized failures first, then I/O, then generic.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(run_error) = cause.downcast_ref::<RunError>() {
            return run_error.exit_code();
        }
    }
    for cause in err.chain() {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            if io_error.kind() == io::ErrorKind::Interrupted {
                return 5;
            }
            return 2;
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return 3;
        }
    }
    4
}
