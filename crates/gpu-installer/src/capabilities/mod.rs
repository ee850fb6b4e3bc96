//! Capability traits the installation driver depends on.
//!
//! Each trait delegates to the host without making decisions of its own.
//! Linux implementations live in [`crate::platform`]; tests supply fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Artifact, DriverRelease, SecureBootKeys, Target, ToolkitRelease};
use crate::error::InstallError;

/// Result of a GPU scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuPresence {
    /// An NVIDIA device is attached.
    pub present: bool,
    /// PCI `vendor:device` id of the first device, e.g. `10de:2330`.
    pub device_id: Option<String>,
}

impl GpuPresence {
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            present: true,
            device_id: Some(id.into()),
        }
    }
}

/// Stateless "is it there?" checks, invoked fresh every time.
#[async_trait]
pub trait GpuDetector: Send + Sync {
    /// Scan the PCI bus for NVIDIA devices.
    async fn detect_gpu(&self) -> Result<GpuPresence, InstallError>;

    /// `nvidia-smi -L` lists at least one GPU UUID.
    async fn driver_installed(&self) -> Result<bool, InstallError>;

    /// `nvcc --version` succeeds in the toolkit prefix.
    async fn toolkit_installed(&self, toolkit: &ToolkitRelease) -> Result<bool, InstallError>;
}

/// Privileged, distribution-specific system changes.
#[async_trait]
pub trait PrivilegedInstaller: Send + Sync {
    /// Human-readable platform name, e.g. `Ubuntu 22.04`.
    fn platform(&self) -> String;

    /// Kernel headers, compiler toolchain, dkms and a kernel update.
    async fn install_prerequisites(&self) -> Result<(), InstallError>;

    /// Register the NVIDIA package repository.
    async fn configure_repository(&self, multiregion: &str) -> Result<(), InstallError>;

    /// Install the driver from the repository.
    async fn install_driver_packages(&self, driver: &DriverRelease) -> Result<(), InstallError>;

    /// Install the toolkit from the repository.
    async fn install_toolkit_packages(&self, toolkit: &ToolkitRelease)
        -> Result<(), InstallError>;

    /// Run the driver `.run` installer silently, signing modules when keys are given.
    async fn run_driver_installer(
        &self,
        installer: &Path,
        keys: Option<&SecureBootKeys>,
    ) -> Result<(), InstallError>;

    /// Run the toolkit `.run` installer silently.
    async fn run_toolkit_installer(&self, installer: &Path) -> Result<(), InstallError>;

    /// Remove a driver installed from a `.run` installer.
    async fn run_driver_uninstaller(&self, installer: &Path) -> Result<(), InstallError>;

    /// Hold kernel packages at their current version.
    async fn lock_kernel(&self) -> Result<(), InstallError>;

    /// Release the kernel hold.
    async fn unlock_kernel(&self) -> Result<(), InstallError>;

    /// Profile script exporting toolkit paths, plus the persistence daemon.
    async fn configure_toolkit_environment(
        &self,
        toolkit: &ToolkitRelease,
    ) -> Result<(), InstallError>;
}

/// Downloads pinned artifacts.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `artifact` into `dest_dir` and verify its checksum.
    ///
    /// A file already present with the right checksum is reused.
    async fn fetch(&self, artifact: &Artifact, dest_dir: &Path) -> Result<PathBuf, InstallError>;
}

/// Builds and runs CUDA code samples against an installed toolkit.
#[async_trait]
pub trait SampleRunner: Send + Sync {
    /// Unpack a samples archive into `dest`; returns the top-level source directory.
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<PathBuf, InstallError>;

    /// Compile the sample in `sample_dir` and run it; returns its stdout.
    async fn build_and_run(
        &self,
        sample_dir: &Path,
        toolkit: &ToolkitRelease,
    ) -> Result<String, InstallError>;
}

/// Signs kernel modules for Secure Boot.
#[async_trait]
pub trait ModuleSigner: Send + Sync {
    /// Sign every NVIDIA module of the running kernel; returns how many were signed.
    async fn sign_modules(&self, keys: &SecureBootKeys) -> Result<usize, InstallError>;
}

/// Reboot and resume-on-boot registration.
#[async_trait]
pub trait Rebooter: Send + Sync {
    /// Arrange for `command` to run again on the next boot.
    async fn register_resume(&self, target: Target, command: &[String])
        -> Result<(), InstallError>;

    /// Remove the resume registration.
    async fn clear_resume(&self, target: Target) -> Result<(), InstallError>;

    /// Schedule a reboot. Returns once scheduled, not once rebooted.
    async fn reboot(&self) -> Result<(), InstallError>;
}

/// Facts about the running host.
#[async_trait]
pub trait HostInfo: Send + Sync {
    /// Identifier that changes on every boot.
    fn boot_id(&self) -> Result<String, InstallError>;

    /// The process may make system changes.
    fn is_privileged(&self) -> bool;

    /// Compute zone of the instance, if it can be determined.
    async fn zone(&self) -> Option<String>;
}

/// Everything the installation driver needs from the outside world.
#[derive(Clone)]
pub struct Capabilities {
    pub gpu: Arc<dyn GpuDetector>,
    pub installer: Arc<dyn PrivilegedInstaller>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub signer: Arc<dyn ModuleSigner>,
    pub rebooter: Arc<dyn Rebooter>,
    pub host: Arc<dyn HostInfo>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("platform", &self.installer.platform())
            .finish_non_exhaustive()
    }
}
