//! Linux capability providers.
//!
//! The package-manager family is chosen once, here, from `/etc/os-release`.

pub mod apt;
pub mod command;
pub mod detect;
pub mod distro;
pub mod dnf;
pub mod fetch;
pub mod host;
pub mod reboot;
pub(crate) mod runfile;
pub mod samples;
pub mod signing;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::capabilities::{ArtifactFetcher, Capabilities, PrivilegedInstaller};
use crate::error::InstallError;

pub use apt::AptInstaller;
pub use command::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use detect::SystemGpuDetector;
pub use distro::{Distro, DistroId, PackageFamily};
pub use dnf::DnfInstaller;
pub use fetch::HttpFetcher;
pub use host::LocalHost;
pub use reboot::SystemdRebooter;
pub use samples::SystemSampleRunner;
pub use signing::KernelModuleSigner;

/// Capabilities for the running host.
///
/// # Errors
///
/// Returns [`InstallError::UnsupportedPlatform`] outside the supported distributions.
pub fn detect(work_dir: &Path) -> Result<Capabilities, InstallError> {
    let distro = Distro::detect()?;
    info!(platform = %distro, "Detected platform");

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let fetcher: Arc<dyn ArtifactFetcher> = Arc::new(HttpFetcher::new()?);

    let installer: Arc<dyn PrivilegedInstaller> = match distro.family() {
        PackageFamily::Apt => Arc::new(AptInstaller::new(
            distro,
            runner.clone(),
            fetcher.clone(),
            work_dir.to_path_buf(),
        )),
        PackageFamily::Dnf => Arc::new(DnfInstaller::new(
            distro,
            runner.clone(),
            work_dir.to_path_buf(),
        )),
    };

    Ok(Capabilities {
        gpu: Arc::new(SystemGpuDetector::new(runner.clone())),
        installer,
        fetcher,
        signer: Arc::new(KernelModuleSigner::new(runner.clone())),
        rebooter: Arc::new(SystemdRebooter::new(runner)),
        host: Arc::new(LocalHost::new()),
    })
}
