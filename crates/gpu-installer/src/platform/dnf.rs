//! Red Hat Enterprise Linux and Rocky Linux.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::capabilities::PrivilegedInstaller;
use crate::config::{
    rhel_repo_url, DriverRelease, SecureBootKeys, ToolkitRelease, CUDA_PROFILE_FILE,
    PERSISTENCED_INSTALLER,
};
use crate::error::InstallError;
use crate::platform::command::{CommandRunner, Invocation};
use crate::platform::distro::{Distro, DistroId};
use crate::platform::runfile;

const KERNEL_EXCLUDE: &str = "kernel*";

/// Add `kernel*` to the `exclude=` entry of the `[main]` section.
///
/// Returns `None` when kernel updates are already excluded.
#[must_use]
pub fn add_kernel_exclude(conf: &str) -> Option<String> {
    edit_main_exclude(conf, |values| {
        if values.iter().any(|v| v == KERNEL_EXCLUDE) {
            return false;
        }
        values.push(KERNEL_EXCLUDE.to_string());
        true
    })
}

/// Remove `kernel*` from the `exclude=` entry.
///
/// Returns `None` when kernel updates were not excluded.
#[must_use]
pub fn remove_kernel_exclude(conf: &str) -> Option<String> {
    edit_main_exclude(conf, |values| {
        let before = values.len();
        values.retain(|v| v != KERNEL_EXCLUDE);
        values.len() != before
    })
}

fn edit_main_exclude(conf: &str, edit: impl FnOnce(&mut Vec<String>) -> bool) -> Option<String> {
    let mut lines: Vec<String> = conf.lines().map(str::to_string).collect();

    let mut section = String::new();
    let mut main_end = None;
    let mut exclude_at = None;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed.trim_matches(['[', ']']).to_string();
            continue;
        }
        if section == "main" {
            main_end = Some(i + 1);
            if let Some((key, _)) = trimmed.split_once('=') {
                if key.trim() == "exclude" {
                    exclude_at = Some(i);
                }
            }
        }
    }

    let mut values: Vec<String> = exclude_at
        .and_then(|i| lines[i].split_once('=').map(|(_, v)| v.to_string()))
        .map(|v| {
            v.split([',', ' '])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if !edit(&mut values) {
        return None;
    }

    let entry = if values.is_empty() {
        None
    } else {
        Some(format!("exclude={}", values.join(", ")))
    };

    match (exclude_at, entry) {
        (Some(i), Some(entry)) => lines[i] = entry,
        (Some(i), None) => {
            lines.remove(i);
        }
        (None, Some(entry)) => match main_end {
            Some(end) => lines.insert(end, entry),
            None => {
                lines.push("[main]".to_string());
                lines.push(entry);
            }
        },
        (None, None) => {}
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Some(out)
}

/// dnf-based installer.
pub struct DnfInstaller {
    distro: Distro,
    runner: Arc<dyn CommandRunner>,
    work_dir: PathBuf,
    dnf_conf: PathBuf,
}

impl DnfInstaller {
    #[must_use]
    pub fn new(distro: Distro, runner: Arc<dyn CommandRunner>, work_dir: PathBuf) -> Self {
        Self {
            distro,
            runner,
            work_dir,
            dnf_conf: PathBuf::from("/etc/dnf/dnf.conf"),
        }
    }

    /// Use a different `dnf.conf`.
    #[must_use]
    pub fn with_dnf_conf(mut self, path: PathBuf) -> Self {
        self.dnf_conf = path;
        self
    }

    fn dnf(args: &[&str]) -> Invocation {
        Invocation::new("dnf").args(args.iter().copied())
    }

    async fn rewrite_dnf_conf(&self, updated: String) -> Result<(), InstallError> {
        let backup = self.dnf_conf.with_extension("conf_backup");
        tokio::fs::copy(&self.dnf_conf, &backup).await?;
        if let Err(e) = tokio::fs::write(&self.dnf_conf, updated).await {
            tokio::fs::copy(&backup, &self.dnf_conf).await?;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl PrivilegedInstaller for DnfInstaller {
    fn platform(&self) -> String {
        self.distro.to_string()
    }

    async fn install_prerequisites(&self) -> Result<(), InstallError> {
        if self.distro.id == DistroId::Rocky {
            // Rocky images ship without lspci.
            self.runner.run(&Self::dnf(&["install", "-y", "pciutils"])).await?;
        }
        self.runner
            .run(&Self::dnf(&[
                "--refresh",
                "install",
                "-y",
                "kernel",
                "kernel-devel",
                "kernel-headers",
                "gcc",
                "gcc-c++",
                "make",
                "bzip2",
            ]))
            .await?;
        Ok(())
    }

    async fn configure_repository(&self, _multiregion: &str) -> Result<(), InstallError> {
        let url = rhel_repo_url(self.distro.major());
        self.runner
            .run(&Self::dnf(&["config-manager", "--add-repo", &url]))
            .await?;
        self.runner.run(&Self::dnf(&["clean", "all"])).await?;
        info!(repository = %url, "NVIDIA repository configured");
        Ok(())
    }

    async fn install_driver_packages(&self, driver: &DriverRelease) -> Result<(), InstallError> {
        let stream = format!("nvidia-driver:{}-dkms", driver.major());
        self.runner
            .run(&Self::dnf(&["module", "install", "-y", &stream]))
            .await?;
        Ok(())
    }

    async fn install_toolkit_packages(
        &self,
        toolkit: &ToolkitRelease,
    ) -> Result<(), InstallError> {
        let package = toolkit.package();
        self.runner.run(&Self::dnf(&["install", "-y", &package])).await?;
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
        let current = tokio::fs::read_to_string(&self.dnf_conf).await?;
        match add_kernel_exclude(&current) {
            Some(updated) => {
                self.rewrite_dnf_conf(updated).await?;
                info!(conf = %self.dnf_conf.display(), "Kernel updates blocked");
            }
            None => info!(conf = %self.dnf_conf.display(), "Kernel updates already blocked"),
        }
        Ok(())
    }

    async fn unlock_kernel(&self) -> Result<(), InstallError> {
        let current = tokio::fs::read_to_string(&self.dnf_conf).await?;
        match remove_kernel_exclude(&current) {
            Some(updated) => {
                self.rewrite_dnf_conf(updated).await?;
                info!(conf = %self.dnf_conf.display(), "Kernel updates unblocked");
            }
            None => info!(conf = %self.dnf_conf.display(), "Kernel updates were not blocked"),
        }
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
