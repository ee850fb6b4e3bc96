//! Process exit codes.

use gpu_installer::{ErrorKind, InstallError};
use image_builder::{BuildError, BuildErrorKind};

pub const SUCCESS: u8 = 0;
pub const FAILED: u8 = 1;
pub const REBOOT_REQUIRED: u8 = 2;
pub const TIMEOUT: u8 = 3;
pub const ALREADY_IN_PROGRESS: u8 = 4;
pub const CONFIGURATION_MISMATCH: u8 = 5;

/// Exit code for a failed command.
pub fn for_error(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<InstallError>() {
        return match e.kind() {
            ErrorKind::AlreadyInProgress => ALREADY_IN_PROGRESS,
            ErrorKind::ConfigurationMismatch => CONFIGURATION_MISMATCH,
            _ => FAILED,
        };
    }
    if let Some(e) = err.downcast_ref::<BuildError>() {
        return match e.kind {
            BuildErrorKind::Timeout => TIMEOUT,
            _ => FAILED,
        };
    }
    FAILED
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use gpu_installer::Target;

    use super::*;

    #[test]
    fn test_install_errors() {
        let busy = anyhow::Error::new(InstallError::AlreadyInProgress {
            target: Target::Driver,
            pid: 42,
        });
        assert_eq!(for_error(&busy), ALREADY_IN_PROGRESS);

        let mismatch: anyhow::Result<()> =
            Err(InstallError::ConfigurationMismatch("branch".into())).context("install_driver");
        assert_eq!(for_error(&mismatch.unwrap_err()), CONFIGURATION_MISMATCH);

        assert_eq!(for_error(&anyhow::Error::new(InstallError::NoGpuDetected)), FAILED);
    }

    #[test]
    fn test_build_errors() {
        let timeout = anyhow::Error::new(BuildError::new(BuildErrorKind::Timeout, "no signal"));
        assert_eq!(for_error(&timeout), TIMEOUT);

        let capture = anyhow::Error::new(BuildError::new(BuildErrorKind::CaptureFailed, "x"));
        assert_eq!(for_error(&capture), FAILED);
        assert_eq!(for_error(&anyhow::anyhow!("anything else")), FAILED);
    }
}
