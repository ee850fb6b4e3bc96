//! Image build orchestration.
//!
//! One build owns one disposable instance. The instance installs everything
//! on its own through its startup script; the orchestrator only watches the
//! serial console, captures the boot disk once the instance is powered off and
//! cleans up. Resource names are recorded before creation so cleanup covers
//! every path, including cancellation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpu_installer::config::mirror_base;
use gpu_installer::SecureBootKeys;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bootstrap::{scan_serial, Bootstrap, Payloads, Signal};
use crate::certs::CertificateSource;
use crate::config::{BuildConfig, KeySource, PollConfig};
use crate::error::{BuildError, BuildErrorKind, CloudError, Resource};
use crate::keys::KeyGenerator;
use crate::providers::{
    ComputeProvider, ImageProvider, ImageRef, ImageRequest, InstanceSpec, InstanceStatus,
};

/// Progress of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Provisioning,
    /// The instance is installing; waiting for its completion marker.
    AwaitingSignal,
    AwaitingOperator,
    ShuttingDown,
    Capturing,
    Succeeded,
    Failed,
    CleaningUp,
    /// Build resources are gone.
    CleanedUp,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning build instance",
            Self::AwaitingSignal => "installing drivers",
            Self::AwaitingOperator => "waiting for operator",
            Self::ShuttingDown => "waiting for shutdown",
            Self::Capturing => "capturing image",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::CleaningUp => "cleaning up",
            Self::CleanedUp => "cleaned up",
        };
        write!(f, "{s}")
    }
}

/// Operator interaction during a build.
#[async_trait]
pub trait Interaction: Send + Sync {
    /// The instance is ready for manual changes; return once the operator is done.
    async fn wait_for_operator(&self, ssh_command: &str) -> Result<(), BuildError>;

    /// Build progress notification.
    fn status_changed(&self, _status: BuildStatus) {}
}

/// Interaction for unattended builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

#[async_trait]
impl Interaction for Unattended {
    async fn wait_for_operator(&self, _ssh_command: &str) -> Result<(), BuildError> {
        Err(BuildError::invalid_config(
            "interactive builds need an operator",
        ))
    }
}

/// Bookkeeping for one build.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub id: String,
    pub status: BuildStatus,
    pub instance: Option<String>,
    pub disk: Option<String>,
    /// Keys generated for this build only, destroyed when it ends.
    pub ephemeral_keys: Option<SecureBootKeys>,
    pub image: Option<ImageRef>,
}

impl BuildJob {
    fn new(id: String) -> Self {
        Self {
            id,
            status: BuildStatus::Pending,
            instance: None,
            disk: None,
            ephemeral_keys: None,
            image: None,
        }
    }

    fn resources(&self) -> Vec<Resource> {
        let mut resources = Vec::new();
        if let Some(instance) = &self.instance {
            resources.push(Resource::Instance(instance.clone()));
        }
        if let Some(disk) = &self.disk {
            resources.push(Resource::Disk(disk.clone()));
        }
        resources
    }
}

/// Instance and disk names for a build.
#[must_use]
pub fn resource_names(config: &BuildConfig, build_id: &str) -> (String, String) {
    let instance = format!(
        "image-builder-{}-{}-{build_id}",
        config.base_image, config.mode
    );
    let disk = format!("{instance}-disk");
    (instance, disk)
}

/// Run-duration limit handed to the provider, after which it deletes the instance.
fn max_run_duration(poll: &PollConfig) -> String {
    let minutes = (poll.signal_timeout + poll.shutdown_timeout).as_secs().div_ceil(60);
    format!("{}m", minutes.max(60))
}

fn capture_failed(err: impl std::fmt::Display) -> BuildError {
    BuildError::new(BuildErrorKind::CaptureFailed, err.to_string())
}

fn cancelled() -> BuildError {
    BuildError::new(BuildErrorKind::Cancelled, "interrupted by operator")
}

fn provision_error(err: CloudError) -> BuildError {
    match err {
        CloudError::QuotaExceeded(message) => {
            BuildError::new(BuildErrorKind::ProvisionFailed, format!("quota exceeded: {message}"))
                .retryable()
        }
        other => BuildError::new(BuildErrorKind::ProvisionFailed, other.to_string()),
    }
}

/// Bakes images.
pub struct ImageBuilder {
    compute: Arc<dyn ComputeProvider>,
    images: Arc<dyn ImageProvider>,
    keys: Arc<dyn KeyGenerator>,
    certs: Arc<dyn CertificateSource>,
    interaction: Arc<dyn Interaction>,
    cancel: CancellationToken,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        images: Arc<dyn ImageProvider>,
        keys: Arc<dyn KeyGenerator>,
        certs: Arc<dyn CertificateSource>,
    ) -> Self {
        Self {
            compute,
            images,
            keys,
            certs,
            interaction: Arc::new(Unattended),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_interaction(mut self, interaction: Arc<dyn Interaction>) -> Self {
        self.interaction = interaction;
        self
    }

    /// Cancelling `token` aborts the build; cleanup still runs.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Build an image.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] classifying the failure, listing any resources
    /// that could not be cleaned up.
    pub async fn build(&self, config: &BuildConfig) -> Result<ImageRef, BuildError> {
        config.validate()?;

        let build_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let scratch = tempfile::TempDir::new().map_err(|e| {
            BuildError::new(BuildErrorKind::ProvisionFailed, format!("scratch directory: {e}"))
        })?;
        let mut job = BuildJob::new(build_id.clone());
        info!(build = %build_id, base = %config.base_image, image = %config.image_name, "Starting image build");

        let result = self.run(config, &mut job, scratch.path()).await;
        if matches!(&result, Err(e) if e.kind == BuildErrorKind::Cancelled) {
            warn!(build = %build_id, "Build cancelled");
        }

        let terminal = if result.is_ok() {
            BuildStatus::Succeeded
        } else {
            BuildStatus::Failed
        };
        self.set_status(&mut job, terminal);

        let leftovers = self.cleanup(config, &mut job).await;
        if let Some(keys) = &job.ephemeral_keys {
            if let Err(e) = self.keys.destroy(keys).await {
                warn!(error = %e, "Failed to destroy generated signing keys");
            }
        }
        if leftovers.is_empty() && !config.skip_cleanup {
            self.set_status(&mut job, BuildStatus::CleanedUp);
        }

        match result {
            Ok(image) => {
                if !leftovers.is_empty() && !config.skip_cleanup {
                    error!(
                        resources = %describe(&leftovers),
                        "Image created but build resources could not be deleted"
                    );
                }
                info!(image = %image, "Image build complete");
                Ok(image)
            }
            Err(e) => {
                error!(build = %job.id, error = %e, "Image build failed");
                Err(e.with_leftovers(leftovers))
            }
        }
    }

    fn set_status(&self, job: &mut BuildJob, status: BuildStatus) {
        job.status = status;
        info!(build = %job.id, status = %status, "Build status");
        self.interaction.status_changed(status);
    }

    /// Race `phase` against cancellation.
    ///
    /// Provider mutations never go through here: dropping a half-finished
    /// create or capture would leave resources cleanup knows nothing about.
    async fn until_cancelled<T>(
        &self,
        phase: impl Future<Output = Result<T, BuildError>>,
    ) -> Result<T, BuildError> {
        tokio::select! {
            result = phase => result,
            () = self.cancel.cancelled() => Err(cancelled()),
        }
    }

    fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        Ok(())
    }

    async fn run(
        &self,
        config: &BuildConfig,
        job: &mut BuildJob,
        scratch: &Path,
    ) -> Result<ImageRef, BuildError> {
        let storage_region = config.storage_region();
        let keys = self
            .until_cancelled(self.prepare_keys(config, job, scratch))
            .await?;
        let payloads = self.until_cancelled(load_payloads(config, &keys)).await?;

        let bootstrap = Bootstrap {
            build_id: job.id.clone(),
            mirror: mirror_base(config.mirror_region()),
            installer_version: config.installer_version.clone(),
            mode: config.mode,
            branch: config.branch,
            driver_only: config.driver_only,
            interactive: config.interactive,
        };

        let (instance, disk) = resource_names(config, &job.id);
        let spec = InstanceSpec {
            name: instance.clone(),
            zone: config.zone.clone(),
            machine_type: config.machine_type.clone(),
            image_family: config.base_image.image_family().to_string(),
            image_project: config.base_image.image_project().to_string(),
            disk_name: disk.clone(),
            disk_size_gb: config.disk_size_gb,
            disk_type: config.disk_type.api_name().to_string(),
            network: config.network.clone(),
            subnet: config.subnet().to_string(),
            max_run_duration: max_run_duration(&config.poll),
            metadata: bootstrap.metadata(&payloads),
        };

        self.check_cancelled()?;
        self.set_status(job, BuildStatus::Provisioning);
        job.instance = Some(instance.clone());
        job.disk = Some(disk.clone());
        self.compute
            .create_instance(&spec)
            .await
            .map_err(provision_error)?;
        self.check_cancelled()?;

        self.set_status(job, BuildStatus::AwaitingSignal);
        self.until_cancelled(self.wait_for_signal(&instance, &job.id, &config.poll))
            .await?;

        if config.interactive {
            self.set_status(job, BuildStatus::AwaitingOperator);
            let ssh_command = self.compute.ssh_command(&instance);
            self.until_cancelled(self.interaction.wait_for_operator(&ssh_command))
                .await?;
            self.compute.stop_instance(&instance).await.map_err(|e| {
                BuildError::new(
                    BuildErrorKind::CaptureFailed,
                    format!("could not stop build instance: {e}"),
                )
            })?;
        }

        self.set_status(job, BuildStatus::ShuttingDown);
        self.until_cancelled(self.wait_for_shutdown(&instance, &config.poll))
            .await?;

        self.set_status(job, BuildStatus::Capturing);
        let certs_dir = scratch.join("certs");
        tokio::fs::create_dir_all(&certs_dir)
            .await
            .map_err(capture_failed)?;
        let mut signature_db = vec![keys.public_key.clone()];
        let certs = self.until_cancelled(async {
            self.certs
                .fetch(&certs_dir)
                .await
                .map_err(|e| capture_failed(format!("certificate download: {e}")))
        });
        signature_db.extend(certs.await?);
        self.check_cancelled()?;

        let image = self
            .images
            .capture_from_disk(&ImageRequest {
                name: config.image_name.clone(),
                source_disk: disk,
                source_disk_zone: config.zone.clone(),
                storage_location: storage_region,
                family: config.image_family.clone(),
                signature_db,
            })
            .await
            .map_err(capture_failed)?;
        job.image = Some(image.clone());
        Ok(image)
    }

    async fn prepare_keys(
        &self,
        config: &BuildConfig,
        job: &mut BuildJob,
        scratch: &Path,
    ) -> Result<SecureBootKeys, BuildError> {
        let generate = |dir: PathBuf| async move {
            self.keys.generate(&dir).await.map_err(|e| {
                BuildError::new(
                    BuildErrorKind::ProvisionFailed,
                    format!("signing key generation: {e}"),
                )
            })
        };
        match &config.keys {
            KeySource::Existing(keys) => Ok(keys.clone()),
            KeySource::Generate { keep_in: Some(dir) } => {
                let keys = generate(dir.clone()).await?;
                info!(dir = %dir.display(), "Signing keys saved");
                Ok(keys)
            }
            KeySource::Generate { keep_in: None } => {
                let keys = generate(scratch.join("keys")).await?;
                job.ephemeral_keys = Some(keys.clone());
                Ok(keys)
            }
        }
    }

    async fn wait_for_signal(
        &self,
        instance: &str,
        build_id: &str,
        poll: &PollConfig,
    ) -> Result<(), BuildError> {
        let deadline = Instant::now() + poll.signal_timeout;
        let mut interval = poll.initial_interval;

        loop {
            match self.compute.serial_output(instance).await {
                Ok(output) => match scan_serial(&output, build_id) {
                    Some(Signal::Success) => {
                        info!(instance = %instance, "Installation finished on build instance");
                        return Ok(());
                    }
                    Some(Signal::Failed(reason)) => {
                        return Err(BuildError::new(BuildErrorKind::InstallFailed, reason));
                    }
                    None => {}
                },
                Err(CloudError::NotFound(_)) => {
                    return Err(BuildError::new(
                        BuildErrorKind::InstallFailed,
                        format!("build instance {instance} disappeared"),
                    ));
                }
                Err(e) => warn!(instance = %instance, error = %e, "Failed to read serial output"),
            }

            sleep_until_next(&mut interval, deadline, poll)
                .await
                .ok_or_else(|| {
                    BuildError::new(
                        BuildErrorKind::Timeout,
                        format!(
                            "no completion signal from {instance} after {}s",
                            poll.signal_timeout.as_secs()
                        ),
                    )
                })?;
        }
    }

    async fn wait_for_shutdown(&self, instance: &str, poll: &PollConfig) -> Result<(), BuildError> {
        let deadline = Instant::now() + poll.shutdown_timeout;
        let mut interval = poll.initial_interval;

        loop {
            match self.compute.instance_status(instance).await {
                Ok(InstanceStatus::Terminated) => return Ok(()),
                Ok(status) => info!(instance = %instance, status = %status, "Waiting for shutdown"),
                Err(CloudError::NotFound(_)) => {
                    return Err(BuildError::new(
                        BuildErrorKind::CaptureFailed,
                        format!("build instance {instance} disappeared before capture"),
                    ));
                }
                Err(e) => warn!(instance = %instance, error = %e, "Failed to read instance status"),
            }

            sleep_until_next(&mut interval, deadline, poll)
                .await
                .ok_or_else(|| {
                    BuildError::new(
                        BuildErrorKind::Timeout,
                        format!("{instance} did not power off"),
                    )
                })?;
        }
    }

    /// Delete the build resources; returns what is left.
    async fn cleanup(&self, config: &BuildConfig, job: &mut BuildJob) -> Vec<Resource> {
        if config.skip_cleanup {
            let kept = job.resources();
            if !kept.is_empty() {
                info!(resources = %describe(&kept), "Skipping cleanup");
            }
            return kept;
        }
        if job.instance.is_none() && job.disk.is_none() {
            return Vec::new();
        }

        self.set_status(job, BuildStatus::CleaningUp);
        let mut leftovers = Vec::new();
        if let Some(instance) = job.instance.clone() {
            match self.compute.delete_instance(&instance).await {
                Ok(()) => job.instance = None,
                Err(e) => {
                    warn!(instance = %instance, error = %e, "Failed to delete build instance");
                    leftovers.push(Resource::Instance(instance));
                }
            }
        }
        if let Some(disk) = job.disk.clone() {
            match self.compute.delete_disk(&disk).await {
                Ok(()) => job.disk = None,
                Err(e) => {
                    warn!(disk = %disk, error = %e, "Failed to delete build disk");
                    leftovers.push(Resource::Disk(disk));
                }
            }
        }
        leftovers
    }
}

/// Sleep for the current interval, bounded by `deadline`. `None` once the deadline passed.
async fn sleep_until_next(
    interval: &mut Duration,
    deadline: Instant,
    poll: &PollConfig,
) -> Option<()> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    tokio::time::sleep((*interval).min(deadline - now)).await;
    *interval = poll.next_interval(*interval);
    Some(())
}

async fn load_payloads(config: &BuildConfig, keys: &SecureBootKeys) -> Result<Payloads, BuildError> {
    let read = |path: PathBuf| async move {
        tokio::fs::read(&path).await.map_err(|e| {
            BuildError::new(
                BuildErrorKind::ProvisionFailed,
                format!("reading {}: {e}", path.display()),
            )
        })
    };
    let custom_script = match &config.custom_script {
        Some(path) => Some(read(path.clone()).await?),
        None => None,
    };
    Ok(Payloads {
        public_key: Some(read(keys.public_key.clone()).await?),
        private_key: Some(read(keys.private_key.clone()).await?),
        custom_script,
    })
}

fn describe(resources: &[Resource]) -> String {
    resources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
