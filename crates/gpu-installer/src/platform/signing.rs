//! Kernel module signing with the kernel's `sign-file` helper.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capabilities::ModuleSigner;
use crate::config::SecureBootKeys;
use crate::error::InstallError;
use crate::platform::command::{CommandRunner, Invocation};

/// Signs NVIDIA modules under `/lib/modules/<kernel>`.
pub struct KernelModuleSigner {
    runner: Arc<dyn CommandRunner>,
    modules_root: PathBuf,
}

impl KernelModuleSigner {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            modules_root: PathBuf::from("/lib/modules"),
        }
    }

    fn sign_file_candidates(kernel: &str) -> [PathBuf; 2] {
        [
            PathBuf::from(format!("/usr/src/linux-headers-{kernel}/scripts/sign-file")),
            PathBuf::from(format!("/usr/src/kernels/{kernel}/scripts/sign-file")),
        ]
    }
}

/// Every `nvidia*.ko` file below `root`.
///
/// # Errors
///
/// Returns an error if a directory cannot be read.
pub async fn find_nvidia_modules(root: &Path) -> Result<Vec<PathBuf>, InstallError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("nvidia") && name.ends_with(".ko") {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl ModuleSigner for KernelModuleSigner {
    async fn sign_modules(&self, keys: &SecureBootKeys) -> Result<usize, InstallError> {
        let kernel = self.runner.run(&Invocation::new("uname").arg("-r")).await?;
        let kernel = kernel.stdout.trim();

        let sign_file = Self::sign_file_candidates(kernel)
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                InstallError::UnsupportedPlatform(format!(
                    "sign-file helper not found for kernel {kernel}"
                ))
            })?;

        let modules = find_nvidia_modules(&self.modules_root.join(kernel)).await?;
        if modules.is_empty() {
            return Err(InstallError::StageFailed {
                stage: crate::stages::StageId::SignModules,
                reason: format!("no NVIDIA kernel modules found for kernel {kernel}"),
            });
        }

        for module in &modules {
            debug!(module = %module.display(), "Signing");
            self.runner
                .run(
                    &Invocation::new(sign_file.display().to_string())
                        .arg("sha256")
                        .arg(keys.private_key.display().to_string())
                        .arg(keys.public_key.display().to_string())
                        .arg(module.display().to_string()),
                )
                .await?;
        }
        info!(count = modules.len(), kernel = %kernel, "Signed kernel modules");
        Ok(modules.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_nvidia_modules() {
        let dir = tempfile::TempDir::new().unwrap();
        let updates = dir.path().join("updates/dkms");
        std::fs::create_dir_all(&updates).unwrap();
        for name in ["nvidia.ko", "nvidia-uvm.ko", "nvidia-drm.ko", "e1000.ko", "nvidia.txt"] {
            std::fs::write(updates.join(name), b"").unwrap();
        }

        let found = find_nvidia_modules(dir.path()).await.unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["nvidia-drm.ko", "nvidia-uvm.ko", "nvidia.ko"]);
    }
}
