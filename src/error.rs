//! Custom error types for the server.
//!
//! Two error types cover the command path:
//!
//! - **`CommandError`**: every way a command can fail to complete. Each variant
//!   maps onto one class of the error taxonomy (validation, hardware, conflict,
//!   abort, persistence) and carries the numeric offset that ends up in the
//!   client-visible error code.
//! - **`PersistError`**: I/O and format failures of the small state files the
//!   server keeps on disk (config-id counters, multrun numbers, calibration
//!   last-run times).
//!
//! Error codes on the wire are `ERROR_CODE_BASE + offset`. Offsets are drawn
//! from a range reserved per command (CONFIG uses 800-899, MULTRUN 1200-1299,
//! and so on; see [`crate::command::CommandKind::code_range_start`]).

use crate::arm::Arm;
use crate::command::CommandKind;
use std::path::PathBuf;
use thiserror::Error;

/// Added to every non-zero offset to form the error code sent to clients.
pub const ERROR_CODE_BASE: i32 = 1_000_000;

/// Offset used when a command is rejected because its arm is busy.
pub const CONFLICT_OFFSET: i32 = 1;
/// Offset used when a handler panicked or returned an internal error.
pub const INTERNAL_OFFSET: i32 = 2;
/// Offset used when a request line could not be parsed into a command.
pub const PARSE_OFFSET: i32 = 3;

/// Convenience alias for handler results.
pub type HandlerResult<T> = std::result::Result<T, CommandError>;

/// Failure of a single command invocation.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Bad or missing payload; detected before any hardware is touched.
    #[error("{message}")]
    Validation {
        /// Offset within the command's code range.
        offset: i32,
        /// Human-readable reason.
        message: String,
    },

    /// A device rejected a request or failed while executing it.
    #[error("{device} failure: {detail}")]
    Hardware {
        /// Offset within the command's code range.
        offset: i32,
        /// Device that failed.
        device: &'static str,
        /// Underlying device error chain.
        detail: String,
    },

    /// Another command already occupies the target arm.
    #[error("Conflicting command already running on {arm}: {running}")]
    Conflict {
        /// Arm that is busy.
        arm: Arm,
        /// Command occupying the arm.
        running: CommandKind,
    },

    /// Cooperative cancellation observed at a checkpoint.
    #[error("Command aborted: {}", reason.as_deref().unwrap_or("no reason given"))]
    Aborted {
        /// Reason supplied by whoever aborted the command.
        reason: Option<String>,
    },

    /// State file could not be read or written.
    #[error("Persistence failure: {source}")]
    Persistence {
        /// Offset within the command's code range.
        offset: i32,
        /// Underlying persistence error.
        #[source]
        source: PersistError,
    },

    /// Handler logic bug or panic.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Build a validation error.
    pub fn validation(offset: i32, message: impl Into<String>) -> Self {
        Self::Validation {
            offset,
            message: message.into(),
        }
    }

    /// Fold a device error chain into a hardware failure.
    pub fn hardware(offset: i32, device: &'static str, err: anyhow::Error) -> Self {
        Self::Hardware {
            offset,
            device,
            detail: format!("{err:#}"),
        }
    }

    /// Wrap a persistence failure.
    pub fn persistence(offset: i32, source: PersistError) -> Self {
        Self::Persistence { offset, source }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Error code reported to the client for a command of kind `kind`.
    pub fn code(&self, kind: CommandKind) -> i32 {
        let offset = match self {
            Self::Validation { offset, .. }
            | Self::Hardware { offset, .. }
            | Self::Persistence { offset, .. } => *offset,
            Self::Conflict { .. } => CONFLICT_OFFSET,
            Self::Aborted { .. } => kind.aborted_offset(),
            Self::Internal(_) => INTERNAL_OFFSET,
        };
        ERROR_CODE_BASE + offset
    }
}

/// Failure reading or writing a persisted state file.
#[derive(Error, Debug)]
pub enum PersistError {
    /// Underlying I/O error.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File contents could not be interpreted.
    #[error("Malformed value {value:?} in {}", path.display())]
    Malformed {
        /// File being read.
        path: PathBuf,
        /// Offending text.
        value: String,
    },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CommandError::hardware(804, "CCD", anyhow::anyhow!("DSP timeout"));
        assert_eq!(err.to_string(), "CCD failure: DSP timeout");
    }

    #[test]
    fn test_codes_are_offset_from_base() {
        let err = CommandError::validation(808, "binning and windowing");
        assert_eq!(err.code(CommandKind::Config), ERROR_CODE_BASE + 808);

        let conflict = CommandError::Conflict {
            arm: Arm::Red,
            running: CommandKind::Multrun,
        };
        assert_eq!(conflict.code(CommandKind::Config), ERROR_CODE_BASE + CONFLICT_OFFSET);
    }

    #[test]
    fn test_abort_code_is_per_command() {
        let err = CommandError::Aborted { reason: None };
        assert!(err.is_aborted());
        assert_ne!(err.code(CommandKind::Config), err.code(CommandKind::Multrun));
    }
}
