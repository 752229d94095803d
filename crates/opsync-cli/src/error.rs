//! Exit-code-bearing error type for the CLI (spec §6.4: "0 success, 64 usage
//! error, 65 validation/confirmation failure, 70 internal failure"). Clap
//! itself owns 64 (a bad invocation never reaches `run`); everything this
//! module raises is either a validation failure the operator can fix by
//! retyping the command, or an internal failure that means the local store
//! is in trouble.

use std::fmt;

#[derive(Debug)]
pub enum CliError {
    /// Bad op id, missing/expired confirmation token, `retry-failed` called
    /// with neither `--id` nor `--all` — the operator's mistake, not ours.
    Validation(String),
    /// Storage or other unexpected failure.
    Internal(anyhow::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Validation(msg) => write!(f, "{msg}"),
            CliError::Internal(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation(_) => 65,
            CliError::Internal(_) => 70,
        }
    }
}

impl From<opsync_queue::QueueError> for CliError {
    fn from(err: opsync_queue::QueueError) -> Self {
        match err {
            opsync_queue::QueueError::NotFound(id) => {
                CliError::Validation(format!("no such op id: {id}"))
            }
            opsync_queue::QueueError::InvalidState { id, status } => {
                CliError::Validation(format!("op {id} is in status {status:?}, operation not permitted"))
            }
            other => CliError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<opsync_kvstore::StorageError> for CliError {
    fn from(err: opsync_kvstore::StorageError) -> Self {
        CliError::Internal(anyhow::anyhow!(err))
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::Internal(err)
    }
}
