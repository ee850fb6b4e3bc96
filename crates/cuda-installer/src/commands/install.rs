//! `install_driver`, `install_cuda` and `uninstall_driver`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use gpu_installer::config::{release_for, InstallRequest};
use gpu_installer::uninstall::uninstall_driver;
use gpu_installer::{
    Branch, InstallMode, InstallationDriver, Outcome, SecureBootKeys, StateStore, Target,
};
use tracing::info;

use crate::exit;
use crate::ui;

/// Options shared by the install commands.
#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Install from NVIDIA's `.run` installers (binary) or the distribution repository (repo).
    #[arg(long, value_name = "MODE", default_value = "binary")]
    pub installation_mode: InstallMode,

    /// Driver branch: prod, nfb or lts.
    #[arg(long, value_name = "BRANCH", default_value = "prod")]
    pub installation_branch: Branch,

    /// Install even if no NVIDIA GPU is attached.
    #[arg(long)]
    pub ignore_no_gpu: bool,

    /// DER certificate used to sign the kernel modules for Secure Boot.
    #[arg(long, value_name = "PATH", requires = "secure_boot_priv_key")]
    pub secure_boot_pub_key: Option<PathBuf>,

    /// Private key matching --secure-boot-pub-key.
    #[arg(long, value_name = "PATH", requires = "secure_boot_pub_key")]
    pub secure_boot_priv_key: Option<PathBuf>,

    /// Do not reboot when a reboot is required; exit with code 2 instead.
    #[arg(long)]
    pub no_reboot: bool,

    /// Do not register a boot-time service that re-runs this command.
    #[arg(long)]
    pub no_resume: bool,
}

impl InstallArgs {
    fn secure_boot(&self) -> Option<SecureBootKeys> {
        match (&self.secure_boot_pub_key, &self.secure_boot_priv_key) {
            (Some(public_key), Some(private_key)) => Some(SecureBootKeys {
                public_key: public_key.clone(),
                private_key: private_key.clone(),
            }),
            _ => None,
        }
    }

    /// Request described by these options.
    pub fn request(&self, target: Target) -> InstallRequest {
        InstallRequest::new(target)
            .with_branch(self.installation_branch)
            .with_mode(self.installation_mode)
            .with_ignore_no_gpu(self.ignore_no_gpu)
            .with_secure_boot(self.secure_boot())
    }
}

/// Command line that re-runs this invocation after a reboot.
fn resume_command() -> Vec<String> {
    resume_args(std::env::args_os(), std::env::current_exe().ok())
}

/// `args` as strings, with the program replaced by `exe` when known.
/// Arguments that are not UTF-8 are converted lossily.
fn resume_args(
    args: impl IntoIterator<Item = OsString>,
    exe: Option<PathBuf>,
) -> Vec<String> {
    let mut args: Vec<String> = args
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    if let (Some(exe), Some(first)) = (exe, args.first_mut()) {
        *first = exe.display().to_string();
    }
    args
}

/// Advance the installation as far as this boot allows.
pub async fn install(target: Target, args: &InstallArgs, dir: &Path) -> Result<u8> {
    let release = release_for(args.installation_branch);
    match target {
        Target::Driver => ui::print_section(&format!(
            "NVIDIA driver {} ({})",
            release.driver.version, args.installation_branch
        )),
        Target::Cuda => ui::print_section(&format!(
            "CUDA Toolkit {}.{}.{} ({})",
            release.toolkit.major, release.toolkit.minor, release.toolkit.patch, args.installation_branch
        )),
    }

    let caps = gpu_installer::platform::detect(dir).context("Failed to detect the platform")?;
    let rebooter = caps.rebooter.clone();

    let mut driver =
        InstallationDriver::new(caps, StateStore::new(dir), args.request(target)).with_work_dir(dir);
    if !args.no_resume {
        driver = driver.with_resume_command(resume_command());
    }

    let outcome = driver
        .run()
        .await
        .with_context(|| format!("The {target} installation did not finish"))?;

    match outcome {
        Outcome::Complete | Outcome::Continue => {
            ui::print_success(&format!("The {target} installation is complete"));
            Ok(exit::SUCCESS)
        }
        Outcome::RebootRequired {
            after,
            already_pending: true,
        } => {
            ui::print_warning(&format!(
                "A reboot requested after '{after}' has not happened yet. Reboot and run this command again."
            ));
            Ok(exit::REBOOT_REQUIRED)
        }
        Outcome::RebootRequired { after, .. } => {
            if args.no_reboot {
                ui::print_info(&format!(
                    "Reboot required after '{after}'. Reboot and run this command again."
                ));
                return Ok(exit::REBOOT_REQUIRED);
            }
            ui::print_step("Rebooting now.");
            info!(stage = %after, "Rebooting to continue the installation");
            rebooter.reboot().await.context("Failed to reboot")?;
            Ok(exit::REBOOT_REQUIRED)
        }
    }
}

/// Options for `uninstall_driver`.
#[derive(Args, Debug, Clone)]
pub struct UninstallArgs {
    /// Branch whose installer is used to remove the driver.
    #[arg(long, value_name = "BRANCH", default_value = "prod")]
    pub installation_branch: Branch,
}

/// Remove the driver.
pub async fn uninstall(args: &UninstallArgs, dir: &Path) -> Result<u8> {
    ui::print_section("Removing the NVIDIA driver");
    let caps = gpu_installer::platform::detect(dir).context("Failed to detect the platform")?;

    let removed = uninstall_driver(&caps, &StateStore::new(dir), args.installation_branch, dir)
        .await
        .context("Failed to uninstall the driver")?;
    if removed {
        ui::print_success("The NVIDIA driver was removed. A reboot is recommended.");
    } else {
        ui::print_info("No NVIDIA driver found; nothing to remove.");
    }
    Ok(exit::SUCCESS)
}
