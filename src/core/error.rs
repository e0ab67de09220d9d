use std::path::PathBuf;

use thiserror::Error;

/// Core error taxonomy.
///
/// Admission errors come back synchronously to the transport and turn into a
/// short user-facing message. Runtime errors are captured into a job's
/// terminal state by the queue worker; `Dead` and `Timeout` are the only
/// variants the session layer acts on for respawn.
#[derive(Error, Debug)]
pub enum CoreError {
    // ── admission ──
    #[error("queue is full ({0} jobs waiting), try again later")]
    OverCapacity(usize),

    #[error("invalid session name: '{0}'")]
    NameInvalid(String),

    #[error("'{0}' is a reserved name")]
    NameReserved(String),

    #[error("session '{0}' already exists")]
    NameExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("the default session cannot be closed, only reset")]
    IsDefault,

    #[error("working directory is not usable: {}", .0.display())]
    WorkdirInvalid(PathBuf),

    #[error("session limit reached (max {0})")]
    TooManySessions(usize),

    // ── runtime / process ──
    #[error("failed to spawn assistant process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("assistant protocol error: {0}")]
    ProtocolViolation(String),

    #[error("assistant process exited unexpectedly")]
    Dead {
        stderr_tail: String,
        /// Text accumulated before the process went away.
        partial: String,
    },

    #[error("assistant process is closed")]
    Closed,

    #[error("assistant did not answer within {0}s")]
    Timeout(u64),

    // ── aggregate / job ──
    #[error("request failed permanently: {cause}")]
    HardFail { cause: String, stderr_tail: String },

    // ── queue bookkeeping ──
    #[error("queue is shutting down")]
    Shutdown,

    #[error("job #{0} is already running and cannot be cancelled")]
    AlreadyRunning(u64),

    #[error("job #{0} already finished")]
    AlreadyTerminal(u64),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stderr tail attached to process-level failures, if any.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            CoreError::Dead { stderr_tail, .. } | CoreError::HardFail { stderr_tail, .. } => {
                if stderr_tail.is_empty() {
                    None
                } else {
                    Some(stderr_tail)
                }
            }
            _ => None,
        }
    }
}
