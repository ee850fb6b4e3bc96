//! `build_image`: bake a GPU-ready disk image.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use gpu_installer::config::{mirror_base, INSTALLER_VERSION};
use gpu_installer::platform::SystemRunner;
use gpu_installer::{Branch, InstallMode, SecureBootKeys};
use image_builder::{
    BaseImage, BuildConfig, BuildError, BuildErrorKind, BuildStatus, DiskType, Gcloud,
    ImageBuilder, Interaction, KeySource, MirrorCertificates, OpenSslKeys,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::exit;
use crate::ui;

#[derive(Args, Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct BuildArgs {
    /// Project the build instance and image are created in.
    #[arg(long, env = "CLOUDSDK_CORE_PROJECT")]
    pub project: String,

    /// Zone of the build instance.
    #[arg(long)]
    pub vm_zone: String,

    /// Base OS image: debian-12, rhel-8, rhel-9, rocky-8, rocky-9, ubuntu-22 or ubuntu-24.
    #[arg(long)]
    pub base_image: BaseImage,

    /// Name of the resulting image.
    #[arg(long)]
    pub image_name: String,

    /// Image family of the resulting image.
    #[arg(long)]
    pub family: Option<String>,

    /// Image storage location; defaults to the build zone's multi-region.
    #[arg(long)]
    pub image_region: Option<String>,

    #[arg(long, value_name = "MODE", default_value = "binary")]
    pub installation_mode: InstallMode,

    #[arg(long, value_name = "BRANCH", default_value = "prod")]
    pub installation_branch: Branch,

    /// Install only the driver, without the CUDA Toolkit.
    #[arg(long)]
    pub driver_only: bool,

    /// Machine type of the build instance. It needs a GPU.
    #[arg(long, default_value = "g2-standard-4")]
    pub vm_type: String,

    /// Boot disk size in GB.
    #[arg(long, default_value_t = 30)]
    pub vm_disk_size: u32,

    /// Boot disk type: ssd, balanced or standard.
    #[arg(long, default_value = "balanced")]
    pub vm_disk_type: DiskType,

    #[arg(long, default_value = "default")]
    pub network: String,

    /// Defaults to the network name.
    #[arg(long)]
    pub subnet: Option<String>,

    /// Existing signing certificate (DER).
    #[arg(long, value_name = "PATH", requires = "secure_boot_priv_key", conflicts_with = "save_keys_path")]
    pub secure_boot_pub_key: Option<PathBuf>,

    /// Existing signing key.
    #[arg(long, value_name = "PATH", requires = "secure_boot_pub_key")]
    pub secure_boot_priv_key: Option<PathBuf>,

    /// Keep the generated signing keys in this directory.
    #[arg(long, value_name = "DIR")]
    pub save_keys_path: Option<PathBuf>,

    /// Script run on the build instance after the installation.
    #[arg(long, value_name = "PATH")]
    pub custom_script: Option<PathBuf>,

    /// Pause for manual changes over SSH before the image is captured.
    #[arg(long)]
    pub interactive: bool,

    /// Keep the build instance and disk.
    #[arg(long)]
    pub skip_cleanup: bool,

    /// Minutes to wait for the installation to finish on the build instance.
    #[arg(long, default_value_t = 60)]
    pub timeout_minutes: u64,

    /// Installer release downloaded by the build instance.
    #[arg(long, default_value = INSTALLER_VERSION)]
    pub installer_version: String,
}

impl BuildArgs {
    pub fn config(&self) -> BuildConfig {
        let mut config = BuildConfig::new(
            &self.project,
            &self.vm_zone,
            self.base_image,
            &self.image_name,
        );
        config.mode = self.installation_mode;
        config.branch = self.installation_branch;
        config.driver_only = self.driver_only;
        config.machine_type.clone_from(&self.vm_type);
        config.disk_type = self.vm_disk_type;
        config.disk_size_gb = self.vm_disk_size;
        config.image_family.clone_from(&self.family);
        config.image_region.clone_from(&self.image_region);
        config.keys = match (&self.secure_boot_pub_key, &self.secure_boot_priv_key) {
            (Some(public_key), Some(private_key)) => KeySource::Existing(SecureBootKeys {
                public_key: public_key.clone(),
                private_key: private_key.clone(),
            }),
            _ => KeySource::Generate {
                keep_in: self.save_keys_path.clone(),
            },
        };
        config.custom_script.clone_from(&self.custom_script);
        config.interactive = self.interactive;
        config.network.clone_from(&self.network);
        config.subnet.clone_from(&self.subnet);
        config.skip_cleanup = self.skip_cleanup;
        config.poll.signal_timeout = Duration::from_secs(self.timeout_minutes * 60);
        config.installer_version.clone_from(&self.installer_version);
        config
    }
}

/// Console interaction: a spinner for progress and a prompt for the operator.
struct Console {
    spinner: ProgressBar,
}

impl Console {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(120));
        Self { spinner }
    }
}

#[async_trait]
impl Interaction for Console {
    async fn wait_for_operator(&self, ssh_command: &str) -> Result<(), BuildError> {
        self.spinner.suspend(|| ui::print_ssh_command(ssh_command));

        let spinner = self.spinner.clone();
        let confirmed = tokio::task::spawn_blocking(move || {
            spinner.suspend(|| {
                Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Done with your changes? The instance will be stopped and captured")
                    .default(true)
                    .interact()
            })
        })
        .await
        .map_err(|e| BuildError::new(BuildErrorKind::Cancelled, e.to_string()))?
        .map_err(|e| BuildError::new(BuildErrorKind::Cancelled, e.to_string()))?;

        if confirmed {
            Ok(())
        } else {
            Err(BuildError::new(
                BuildErrorKind::Cancelled,
                "operator declined to capture the image",
            ))
        }
    }

    fn status_changed(&self, status: BuildStatus) {
        self.spinner.set_message(status.to_string());
    }
}

/// Build the image, deleting build resources on every path unless told not to.
pub async fn run(args: &BuildArgs) -> Result<u8> {
    let config = args.config();
    ui::print_section(&format!(
        "Building {} from {} ({}, {})",
        config.image_name, config.base_image, config.mode, config.branch
    ));

    let runner = Arc::new(SystemRunner);
    let gcloud = Arc::new(Gcloud::new(&config.project, &config.zone, runner.clone()));
    let cancel = CancellationToken::new();
    let console = Arc::new(Console::new());
    let builder = ImageBuilder::new(
        gcloud.clone(),
        gcloud,
        Arc::new(OpenSslKeys::new(runner)),
        Arc::new(MirrorCertificates::new(&mirror_base(config.mirror_region()))),
    )
    .with_interaction(console.clone())
    .with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up build resources");
            cancel.cancel();
        }
    });

    let result = builder.build(&config).await;
    console.spinner.finish_and_clear();

    match result {
        Ok(image) => {
            ui::print_success(&format!("Image {image} is ready"));
            if config.skip_cleanup {
                ui::print_warning("Cleanup skipped; the build instance and disk were kept");
            }
            Ok(exit::SUCCESS)
        }
        Err(e) => {
            if e.retryable {
                ui::print_warning("This failure is usually temporary. Try again later or in another zone.");
            }
            if !e.leftovers.is_empty() {
                ui::print_leftovers(&e.leftovers);
            }
            Err(e).context("Image build failed")
        }
    }
}
