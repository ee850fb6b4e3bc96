//! Read-only verification, independent of any installation state.

use serde::Serialize;
use tracing::{info, warn};

use crate::capabilities::{ArtifactFetcher, GpuDetector, GpuPresence, SampleRunner};
use crate::config::{release_for, samples_artifact, Branch, Target};
use crate::error::InstallError;

/// Samples that must build and report a pass, relative to the samples root.
pub const CUDA_SAMPLES: [&str; 2] = [
    "Samples/1_Utilities/deviceQuery",
    "Samples/1_Utilities/bandwidthTest",
];

const SAMPLE_PASS: &str = "Result = PASS";

/// What was found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub target: Target,
    pub gpu: GpuPresence,
    pub driver_installed: bool,
    /// Only checked for [`Target::Cuda`].
    pub toolkit_installed: Option<bool>,
    /// Whether the CUDA samples built and passed; `None` when not run.
    pub samples_passed: Option<bool>,
}

impl VerificationReport {
    /// Everything the target needs is present.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.driver_installed
            && self.toolkit_installed.unwrap_or(true)
            && self.samples_passed.unwrap_or(true)
    }
}

/// Compile-and-run check of the toolkit.
#[derive(Clone, Copy)]
pub struct SampleCheck<'a> {
    pub fetcher: &'a dyn ArtifactFetcher,
    pub runner: &'a dyn SampleRunner,
    /// Mirror the samples archive is downloaded from.
    pub multiregion: &'a str,
}

/// Detect GPU, driver and (for CUDA) toolkit presence.
///
/// With `samples`, a CUDA toolkit only counts as working once the bundled
/// samples compile and pass on the GPU. They run only when the driver and
/// `nvcc` are already present.
///
/// # Errors
///
/// Returns an error if a detection command cannot be run at all or the
/// samples archive cannot be downloaded.
pub async fn verify(
    gpu: &dyn GpuDetector,
    target: Target,
    branch: Branch,
    samples: Option<SampleCheck<'_>>,
) -> Result<VerificationReport, InstallError> {
    let presence = gpu.detect_gpu().await?;
    let driver_installed = gpu.driver_installed().await?;
    let toolkit_installed = match target {
        Target::Driver => None,
        Target::Cuda => Some(gpu.toolkit_installed(&release_for(branch).toolkit).await?),
    };
    let samples_passed = match samples {
        Some(check) if driver_installed && toolkit_installed == Some(true) => {
            Some(run_samples(check, branch).await?)
        }
        _ => None,
    };

    let report = VerificationReport {
        target,
        gpu: presence,
        driver_installed,
        toolkit_installed,
        samples_passed,
    };
    info!(
        target = %target,
        gpu = report.gpu.present,
        driver = report.driver_installed,
        toolkit = ?report.toolkit_installed,
        samples = ?report.samples_passed,
        "Verification finished"
    );
    Ok(report)
}

async fn run_samples(check: SampleCheck<'_>, branch: Branch) -> Result<bool, InstallError> {
    let toolkit = release_for(branch).toolkit;
    let scratch = tempfile::TempDir::new()?;
    info!(dir = %scratch.path().display(), samples = toolkit.samples, "Building CUDA samples");

    let archive = check
        .fetcher
        .fetch(&samples_artifact(check.multiregion, branch), scratch.path())
        .await?;
    let root = match check.runner.unpack(&archive, scratch.path()).await {
        Ok(root) => root,
        Err(e) => {
            warn!(error = %e, "Could not unpack CUDA samples");
            return Ok(false);
        }
    };

    for sample in CUDA_SAMPLES {
        match check.runner.build_and_run(&root.join(sample), &toolkit).await {
            Ok(stdout) if stdout.contains(SAMPLE_PASS) => info!(sample, "Sample passed"),
            Ok(_) => {
                warn!(sample, "Sample ran without reporting a pass");
                return Ok(false);
            }
            Err(e) => {
                warn!(sample, error = %e, "Sample failed");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_installed() {
        let mut report = VerificationReport {
            target: Target::Cuda,
            gpu: GpuPresence::device("10de:2330"),
            driver_installed: true,
            toolkit_installed: Some(false),
            samples_passed: None,
        };
        assert!(!report.is_installed());
        report.toolkit_installed = Some(true);
        assert!(report.is_installed());
        report.samples_passed = Some(false);
        assert!(!report.is_installed());
        report.samples_passed = Some(true);
        assert!(report.is_installed());

        report.target = Target::Driver;
        report.toolkit_installed = None;
        report.samples_passed = None;
        assert!(report.is_installed());
        report.driver_installed = false;
        assert!(!report.is_installed());
    }
}
