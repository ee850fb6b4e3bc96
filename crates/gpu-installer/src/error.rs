//! Installer error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Target;
use crate::stages::StageId;

/// Errors raised by the installation state machine and its capability providers.
#[derive(Error, Debug)]
pub enum InstallError {
    /// The process lacks the privileges a stage needs.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The host OS/distribution is not in the supported set.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// No NVIDIA device was found and the caller did not opt out of the check.
    #[error("No NVIDIA GPU detected (use --ignore-no-gpu to install anyway)")]
    NoGpuDetected,

    /// Network or mirror failure that is worth retrying.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Persisted state disagrees with the requested parameters.
    #[error("Configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    /// A stage failed for a non-retryable reason.
    #[error("Stage '{stage}' failed: {reason}")]
    StageFailed { stage: StageId, reason: String },

    /// Another invocation for the same target holds the lock.
    #[error("A {target} installation is already in progress (pid {pid})")]
    AlreadyInProgress { target: Target, pid: u32 },

    /// A command exited unsuccessfully.
    #[error("Command `{command}` exited with code {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Downloaded file does not match its pinned checksum.
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// Bad user input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The state file cannot be parsed.
    #[error("Corrupt state file {path}: {message}")]
    CorruptState { path: String, message: String },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of an [`InstallError`], persisted with the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    UnsupportedPlatform,
    NoGpuDetected,
    Transient,
    ConfigurationMismatch,
    StageFailed,
    AlreadyInProgress,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission_denied",
            Self::UnsupportedPlatform => "unsupported_platform",
            Self::NoGpuDetected => "no_gpu_detected",
            Self::Transient => "transient",
            Self::ConfigurationMismatch => "configuration_mismatch",
            Self::StageFailed => "stage_failed",
            Self::AlreadyInProgress => "already_in_progress",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

impl InstallError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            Self::NoGpuDetected => ErrorKind::NoGpuDetected,
            Self::Transient(_) => ErrorKind::Transient,
            Self::ConfigurationMismatch(_) => ErrorKind::ConfigurationMismatch,
            Self::StageFailed { .. } => ErrorKind::StageFailed,
            Self::AlreadyInProgress { .. } => ErrorKind::AlreadyInProgress,
            Self::Command { .. }
            | Self::ChecksumMismatch { .. }
            | Self::InvalidArgument(_)
            | Self::CorruptState { .. }
            | Self::Io(_)
            | Self::Serialization(_) => ErrorKind::Other,
        }
    }

    /// Whether a stage may be retried after this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Attach the stage to errors that do not already carry a precise kind.
    #[must_use]
    pub fn in_stage(self, stage: StageId) -> Self {
        match self.kind() {
            ErrorKind::Other => Self::StageFailed {
                stage,
                reason: self.to_string(),
            },
            _ => self,
        }
    }
}

impl From<reqwest::Error> for InstallError {
    fn from(err: reqwest::Error) -> Self {
        // Client errors (404, 403) will not fix themselves.
        match err.status() {
            Some(status) if status.is_client_error() => {
                Self::InvalidArgument(format!("download rejected: {err}"))
            }
            _ => Self::Transient(err.to_string()),
        }
    }
}
