//! Reboot with resume-on-boot through a systemd oneshot unit.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::capabilities::Rebooter;
use crate::config::Target;
use crate::error::InstallError;
use crate::platform::command::{CommandRunner, Invocation};

/// Unit name for a target.
#[must_use]
pub fn unit_name(target: Target) -> String {
    format!("cuda-installer-resume-{target}.service")
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Unit file re-running `command` once the network is up.
#[must_use]
pub fn unit_file(target: Target, command: &[String]) -> String {
    let exec = command.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ");
    format!(
        "[Unit]\n\
         Description=Resume {target} installation after reboot\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={exec}\n\
         StandardOutput=journal+console\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

/// systemd-based rebooter.
pub struct SystemdRebooter {
    runner: Arc<dyn CommandRunner>,
    unit_dir: PathBuf,
}

impl SystemdRebooter {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }

    fn systemctl(args: &[&str]) -> Invocation {
        Invocation::new("systemctl").args(args.iter().copied())
    }
}

#[async_trait]
impl Rebooter for SystemdRebooter {
    async fn register_resume(
        &self,
        target: Target,
        command: &[String],
    ) -> Result<(), InstallError> {
        let name = unit_name(target);
        let path = self.unit_dir.join(&name);
        tokio::fs::write(&path, unit_file(target, command)).await?;
        self.runner.run(&Self::systemctl(&["daemon-reload"])).await?;
        self.runner.run(&Self::systemctl(&["enable", &name])).await?;
        info!(unit = %name, "Installation will resume after reboot");
        Ok(())
    }

    async fn clear_resume(&self, target: Target) -> Result<(), InstallError> {
        let name = unit_name(target);
        let path = self.unit_dir.join(&name);
        if !path.exists() {
            return Ok(());
        }
        if let Err(e) = self.runner.run(&Self::systemctl(&["disable", &name])).await {
            warn!(unit = %name, error = %e, "Failed to disable resume unit");
        }
        tokio::fs::remove_file(&path).await?;
        self.runner.run(&Self::systemctl(&["daemon-reload"])).await?;
        info!(unit = %name, "Removed resume unit");
        Ok(())
    }

    async fn reboot(&self) -> Result<(), InstallError> {
        info!("Rebooting now");
        self.runner
            .run(&Invocation::new("shutdown").args(["-r", "now"]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_file() {
        let cmd = vec![
            "/usr/local/bin/cuda-installer".to_string(),
            "install_driver".to_string(),
            "--secure-boot-pub-key".to_string(),
            "/root/my keys/pub.der".to_string(),
        ];
        let unit = unit_file(Target::Driver, &cmd);
        assert!(unit.contains(
            "ExecStart=/usr/local/bin/cuda-installer install_driver --secure-boot-pub-key \"/root/my keys/pub.der\"\n"
        ));
        assert!(unit.contains("Type=oneshot"));
        assert_eq!(unit_name(Target::Cuda), "cuda-installer-resume-cuda.service");
    }
}
