use std::io;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;

/// Failure reported by an external collaborator (attach, probe, format, mount, copy).
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Safety lock engaged: destructive operation requires explicit confirmation")]
    SafetyLock,

    #[error("Device is busy (mounted or in use)")]
    DeviceBusy,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Image not attached: {0}")]
    NotAttached(String),

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {program} after {timeout_secs}s")]
    CommandTimeout { program: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl HalError {
    /// True when the collaborator gave up waiting rather than failing outright.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HalError::CommandTimeout { .. })
    }
}
