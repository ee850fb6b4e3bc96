//! Build error types.

use std::fmt;

use thiserror::Error;

/// A cloud resource created by a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Instance(String),
    Disk(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(name) => write!(f, "instance {name}"),
            Self::Disk(name) => write!(f, "disk {name}"),
        }
    }
}

/// What went wrong with a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    /// Rejected before any resource was created.
    InvalidConfig,
    /// The build instance could not be created.
    ProvisionFailed,
    /// The installation inside the build instance failed.
    InstallFailed,
    /// The disk image could not be created.
    CaptureFailed,
    /// No completion signal within the timeout.
    Timeout,
    /// Interrupted by the operator.
    Cancelled,
}

impl fmt::Display for BuildErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidConfig => "invalid configuration",
            Self::ProvisionFailed => "provisioning failed",
            Self::InstallFailed => "installation failed",
            Self::CaptureFailed => "image capture failed",
            Self::Timeout => "timed out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A failed build, with whatever resources it left behind.
#[derive(Error, Debug)]
#[error("Image build {kind}: {message}")]
pub struct BuildError {
    pub kind: BuildErrorKind,
    pub message: String,
    /// Retrying later may succeed (quota exhaustion).
    pub retryable: bool,
    /// Resources that still exist after cleanup.
    pub leftovers: Vec<Resource>,
}

impl BuildError {
    #[must_use]
    pub fn new(kind: BuildErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            leftovers: Vec::new(),
        }
    }

    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(BuildErrorKind::InvalidConfig, message)
    }

    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    #[must_use]
    pub fn with_leftovers(mut self, leftovers: Vec<Resource>) -> Self {
        self.leftovers = leftovers;
        self
    }
}

/// Errors from cloud providers.
#[derive(Error, Debug)]
pub enum CloudError {
    /// A provider command failed.
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    /// Resource quota exhausted.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
