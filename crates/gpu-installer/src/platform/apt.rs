//! Debian and Ubuntu.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use crate::capabilities::{ArtifactFetcher, PrivilegedInstaller};
use crate::config::{
    deb_keyring_artifact, DriverRelease, SecureBootKeys, ToolkitRelease, CUDA_PROFILE_FILE,
    PERSISTENCED_INSTALLER,
};
use crate::error::InstallError;
use crate::platform::command::{CommandRunner, Invocation};
use crate::platform::distro::{Distro, DistroId};
use crate::platform::runfile;

static CLOUD_KERNEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"linux-image-(\d+)\.(\d+)\.(\d+)-(\d+)-cloud-amd64").expect("valid regex")
});

/// Newest Debian cloud kernel in `apt-cache search` output on the same
/// `major.minor` line as `current` (`6.1.0-18-cloud-amd64`).
#[must_use]
pub fn newest_cloud_kernel(search_output: &str, current: &str) -> Option<String> {
    let mut parts = current.split(['.', '-']);
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;

    CLOUD_KERNEL
        .captures_iter(search_output)
        .filter_map(|c| {
            let nums: Vec<u32> = (1..=4).filter_map(|i| c[i].parse().ok()).collect();
            (nums.len() == 4 && nums[0] == major && nums[1] == minor)
                .then(|| (nums[2], nums[3]))
        })
        .max()
        .map(|(patch, micro)| format!("{major}.{minor}.{patch}-{micro}-cloud-amd64"))
}

/// apt-based installer.
pub struct AptInstaller {
    distro: Distro,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn ArtifactFetcher>,
    work_dir: PathBuf,
}

impl AptInstaller {
    #[must_use]
    pub fn new(
        distro: Distro,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn ArtifactFetcher>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            distro,
            runner,
            fetcher,
            work_dir,
        }
    }

    fn apt_get(args: &[&str]) -> Invocation {
        Invocation::new("apt-get")
            .args(args.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    async fn kernel_version(&self) -> Result<String, InstallError> {
        let out = self.runner.run(&Invocation::new("uname").arg("-r")).await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn kernel_packages(&self) -> Result<Vec<String>, InstallError> {
        let kernel = self.kernel_version().await?;
        let mut packages = vec![
            format!("linux-image-{kernel}"),
            format!("linux-headers-{kernel}"),
        ];
        match self.distro.id {
            DistroId::Ubuntu => {
                packages.extend(["linux-image-gcp".into(), "linux-headers-gcp".into()]);
            }
            _ => {
                packages.extend([
                    "linux-image-cloud-amd64".into(),
                    "linux-headers-cloud-amd64".into(),
                ]);
            }
        }
        Ok(packages)
    }
}

#[async_trait]
impl PrivilegedInstaller for AptInstaller {
    fn platform(&self) -> String {
        self.distro.to_string()
    }

    async fn install_prerequisites(&self) -> Result<(), InstallError> {
        self.runner.run(&Self::apt_get(&["update"])).await?;

        let kernel: Vec<String> = if self.distro.id == DistroId::Ubuntu {
            vec!["linux-image-gcp".into(), "linux-headers-gcp".into()]
        } else {
            // Stay on the running kernel's major.minor line.
            let current = self.kernel_version().await?;
            let search = self
                .runner
                .run(&Invocation::new("apt-cache").args(["search", "linux-image"]))
                .await?;
            let wanted = newest_cloud_kernel(&search.stdout, &current).unwrap_or(current);
            info!(kernel = %wanted, "Selected kernel");
            vec![
                format!("linux-image-{wanted}"),
                format!("linux-headers-{wanted}"),
            ]
        };

        let mut args = vec!["install", "-y"];
        args.extend(kernel.iter().map(String::as_str));
        args.extend([
            "gcc",
            "make",
            "dkms",
            "pciutils",
            "software-properties-common",
        ]);
        self.runner.run(&Self::apt_get(&args)).await?;
        Ok(())
    }

    async fn configure_repository(&self, multiregion: &str) -> Result<(), InstallError> {
        let (system, version) = self.distro.repo_id();
        let artifact = deb_keyring_artifact(multiregion, system, &version).ok_or_else(|| {
            InstallError::UnsupportedPlatform(format!(
                "no NVIDIA repository for {}",
                self.distro
            ))
        })?;
        let keyring = self.fetcher.fetch(&artifact, &self.work_dir).await?;
        self.runner
            .run(&Invocation::new("dpkg").arg("-i").arg(keyring.display().to_string()))
            .await?;
        self.runner.run(&Self::apt_get(&["update"])).await?;
        info!(repository = %format!("{system}{version}"), "NVIDIA repository configured");
        Ok(())
    }

    async fn install_driver_packages(&self, driver: &DriverRelease) -> Result<(), InstallError> {
        let kernel = self.kernel_version().await?;
        let package = format!("cuda-drivers-{}", driver.major());
        let headers = format!("linux-headers-{kernel}");
        self.runner
            .run(&Self::apt_get(&["install", "-y", &headers, &package]))
            .await?;
        Ok(())
    }

    async fn install_toolkit_packages(
        &self,
        toolkit: &ToolkitRelease,
    ) -> Result<(), InstallError> {
        let package = toolkit.package();
        self.runner
            .run(&Self::apt_get(&["install", "-y", &package]))
            .await?;
        Ok(())
    }

    async fn run_driver_installer(
        &self,
        installer: &Path,
        keys: Option<&SecureBootKeys>,
    ) -> Result<(), InstallError> {
        runfile::run_driver_installer(self.runner.as_ref(), installer, keys).await
    }

    async fn run_toolkit_installer(&self, installer: &Path) -> Result<(), InstallError> {
        runfile::run_toolkit_installer(self.runner.as_ref(), installer).await
    }

    async fn run_driver_uninstaller(&self, installer: &Path) -> Result<(), InstallError> {
        runfile::run_driver_uninstaller(self.runner.as_ref(), installer).await
    }

    async fn lock_kernel(&self) -> Result<(), InstallError> {
        info!("Locking kernel updates");
        let packages = self.kernel_packages().await?;
        self.runner
            .run(&Invocation::new("apt-mark").arg("hold").args(packages))
            .await?;
        Ok(())
    }

    async fn unlock_kernel(&self) -> Result<(), InstallError> {
        info!("Unlocking kernel updates");
        let packages = self.kernel_packages().await?;
        self.runner
            .run(&Invocation::new("apt-mark").arg("unhold").args(packages))
            .await?;
        Ok(())
    }

    async fn configure_toolkit_environment(
        &self,
        toolkit: &ToolkitRelease,
    ) -> Result<(), InstallError> {
        runfile::configure_toolkit_environment(
            self.runner.as_ref(),
            toolkit,
            Path::new(CUDA_PROFILE_FILE),
            &self.work_dir,
            Path::new(PERSISTENCED_INSTALLER),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = "\
linux-image-6.1.0-17-cloud-amd64 - Linux 6.1 for x86-64 cloud
linux-image-6.1.0-25-cloud-amd64 - Linux 6.1 for x86-64 cloud
linux-image-6.1.0-9-cloud-amd64 - Linux 6.1 for x86-64 cloud
linux-image-6.10.0-1-cloud-amd64 - Linux 6.10 for x86-64 cloud
linux-image-cloud-amd64 - Linux for x86-64 cloud (meta-package)
";

    #[test]
    fn test_newest_cloud_kernel_same_line() {
        assert_eq!(
            newest_cloud_kernel(SEARCH, "6.1.0-17-cloud-amd64").as_deref(),
            Some("6.1.0-25-cloud-amd64")
        );
    }

    #[test]
    fn test_newest_cloud_kernel_none() {
        assert_eq!(newest_cloud_kernel(SEARCH, "5.10.0-28-cloud-amd64"), None);
        assert_eq!(newest_cloud_kernel(SEARCH, "garbage"), None);
    }
}
