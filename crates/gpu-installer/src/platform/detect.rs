//! GPU, driver and toolkit detection.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::capabilities::{GpuDetector, GpuPresence};
use crate::config::ToolkitRelease;
use crate::error::InstallError;
use crate::platform::command::{CommandRunner, Invocation};

static NVIDIA_PCI_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"10de:[0-9a-fA-F]{4}").expect("valid regex"));

/// First NVIDIA device in `lspci -n` output.
#[must_use]
pub fn parse_lspci(output: &str) -> GpuPresence {
    output
        .lines()
        .find_map(|line| NVIDIA_PCI_ID.find(line))
        .map_or_else(GpuPresence::absent, |m| GpuPresence::device(m.as_str()))
}

/// Detector that shells out to `lspci`, `nvidia-smi` and `nvcc`.
pub struct SystemGpuDetector {
    runner: Arc<dyn CommandRunner>,
}

impl SystemGpuDetector {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Run a probe; a missing binary counts as a failed probe.
    async fn probe(&self, invocation: &Invocation) -> Result<Option<String>, InstallError> {
        match self.runner.output(invocation).await {
            Ok(out) if out.success() => Ok(Some(out.stdout)),
            Ok(_) | Err(InstallError::Command { code: None, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl GpuDetector for SystemGpuDetector {
    async fn detect_gpu(&self) -> Result<GpuPresence, InstallError> {
        let out = self.runner.run(&Invocation::new("lspci").arg("-n")).await?;
        let presence = parse_lspci(&out.stdout);
        debug!(present = presence.present, device = ?presence.device_id, "GPU scan");
        Ok(presence)
    }

    async fn driver_installed(&self) -> Result<bool, InstallError> {
        let out = self.probe(&Invocation::new("nvidia-smi").arg("-L")).await?;
        Ok(out.is_some_and(|s| s.contains("UUID")))
    }

    async fn toolkit_installed(&self, toolkit: &ToolkitRelease) -> Result<bool, InstallError> {
        let nvcc = toolkit.bin_dir().join("nvcc");
        let out = self
            .probe(&Invocation::new(nvcc.display().to_string()).arg("--version"))
            .await?;
        let version = format!("release {}.{}", toolkit.major, toolkit.minor);
        Ok(out.is_some_and(|s| s.contains(&version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lspci_finds_nvidia() {
        let out = "\
00:00.0 0600: 8086:1237 (rev 02)
00:01.0 0601: 8086:7110 (rev 03)
00:04.0 0302: 10de:2330 (rev a1)
";
        let gpu = parse_lspci(out);
        assert!(gpu.present);
        assert_eq!(gpu.device_id.as_deref(), Some("10de:2330"));
    }

    #[test]
    fn test_parse_lspci_without_nvidia() {
        let gpu = parse_lspci("00:00.0 0600: 8086:1237 (rev 02)\n");
        assert_eq!(gpu, GpuPresence::absent());
    }
}
