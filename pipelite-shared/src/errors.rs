//! Error types shared by the host runtime and the spawner helper.

use thiserror::Error;

/// Result alias used across pipelite crates.
pub type PipeliteResult<T> = Result<T, PipeliteError>;

/// Errors surfaced by pipelite operations.
///
/// Recoverable I/O errors (`Errno`) are delivered to the one caller whose
/// operation failed; the controller stays alive. `Handshake` errors are fatal
/// to process construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipeliteError {
    /// Spawn-time validation failure: command not found, bad working
    /// directory. No child is created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The fd hand-off with the spawner helper failed or timed out.
    #[error("spawner handshake failed: {0}")]
    Handshake(String),

    /// Raw errno from a pipe read/write/close.
    #[error("os error (errno {0})")]
    Errno(i32),

    /// A read is already in flight on this process.
    #[error("another read is pending")]
    PendingRead,

    /// A write is already in flight on this process.
    #[error("another write is pending")]
    PendingWrite,

    /// Stdin was closed; no further writes are possible.
    #[error("stdin is closed")]
    Closed,

    /// The process already exited with the given status.
    #[error("process exited with status {0}")]
    Exited(i32),

    /// Signal delivery failed because the OS pid is no longer known.
    #[error("process is not alive")]
    ProcessNotAlive,

    /// The deadline fired before the process exited.
    #[error("timed out waiting for exit")]
    Timeout,

    /// The controller was stopped while the caller was waiting.
    #[error("controller stopped")]
    Stopped,

    /// Invariant violation inside pipelite itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipeliteError {
    /// Raw errno carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            PipeliteError::Errno(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<nix::errno::Errno> for PipeliteError {
    fn from(errno: nix::errno::Errno) -> Self {
        PipeliteError::Errno(errno as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_accessor_only_matches_os_errors() {
        assert_eq!(PipeliteError::Errno(libc::EPIPE).errno(), Some(libc::EPIPE));
        assert_eq!(PipeliteError::PendingRead.errno(), None);
    }

    #[test]
    fn nix_errno_converts_to_raw_value() {
        let err: PipeliteError = nix::errno::Errno::EAGAIN.into();
        assert_eq!(err, PipeliteError::Errno(libc::EAGAIN));
    }
}
