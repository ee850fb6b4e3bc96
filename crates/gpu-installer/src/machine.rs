//! The installation driver.
//!
//! Each invocation loads the persisted state, runs stages until one needs a
//! reboot, everything is done, or a stage fails, and persists after every
//! transition. Invoking it once per boot until it reports [`Outcome::Complete`]
//! installs the target.

use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::capabilities::Capabilities;
use crate::config::{
    driver_artifact, multiregion_for, release_for, toolkit_artifact, InstallRequest, Target,
    FALLBACK_MULTIREGION, INSTALLER_DIR,
};
use crate::error::InstallError;
use crate::stages::{self, StageId};
use crate::state::{InstallationState, RetryConfig, StateStore};
use crate::verify;

/// Result of a successful [`InstallationDriver::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A stage completed; call again.
    Continue,
    /// The host must reboot before anything else runs.
    RebootRequired {
        /// Stage that asked for the reboot.
        after: StageId,
        /// The reboot was requested by an earlier invocation and has not happened yet.
        already_pending: bool,
    },
    /// Every stage has completed.
    Complete,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::RebootRequired { after, .. } => write!(f, "reboot required after {after}"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Drives one target's installation for one request.
pub struct InstallationDriver {
    caps: Capabilities,
    store: StateStore,
    request: InstallRequest,
    retry: RetryConfig,
    work_dir: PathBuf,
    resume_command: Option<Vec<String>>,
}

impl InstallationDriver {
    #[must_use]
    pub fn new(caps: Capabilities, store: StateStore, request: InstallRequest) -> Self {
        Self {
            caps,
            store,
            request,
            retry: RetryConfig::default(),
            work_dir: PathBuf::from(INSTALLER_DIR),
            resume_command: None,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Directory for downloaded installers.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Command to re-run on the next boot when a reboot is required.
    #[must_use]
    pub fn with_resume_command(mut self, command: Vec<String>) -> Self {
        self.resume_command = Some(command);
        self
    }

    #[must_use]
    pub fn request(&self) -> &InstallRequest {
        &self.request
    }

    /// Take the target lock and advance until something other than
    /// [`Outcome::Continue`] happens.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error; progress up to it is persisted.
    pub async fn run(&self) -> Result<Outcome, InstallError> {
        self.require_privilege()?;
        let boot_id = self.caps.host.boot_id()?;
        let _lock = self.store.lock(self.request.target, &boot_id)?;

        let mut state = self.load_or_create()?;
        loop {
            match self.advance(&mut state).await? {
                Outcome::Continue => {}
                outcome => return Ok(outcome),
            }
        }
    }

    /// Load persisted state and check it against the request, or start fresh.
    ///
    /// A finished installation requested again with different parameters is
    /// archived and a new one started.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::ConfigurationMismatch`] if an unfinished state was
    /// started with different parameters or does not fit the stage registry.
    pub fn load_or_create(&self) -> Result<InstallationState, InstallError> {
        if let Some(state) = self.store.load(self.request.target)? {
            if let Err(e) = state.check_request(&self.request) {
                if !state.is_complete() {
                    return Err(e);
                }
                info!(reason = %e, "Previous installation finished with other parameters");
                self.store.archive(self.request.target)?;
                return self.start_new();
            }
            Self::check_prefix(&state)?;
            if let Some(failure) = &state.last_error {
                warn!(
                    stage = %failure.stage,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Previous attempt failed"
                );
            }
            return Ok(state);
        }
        self.start_new()
    }

    fn start_new(&self) -> Result<InstallationState, InstallError> {
        let mut state = InstallationState::new(&self.request);
        self.store.save(&mut state)?;
        info!(
            target = %state.target,
            branch = %state.branch,
            mode = %state.mode,
            "Starting new installation"
        );
        Ok(state)
    }

    fn check_prefix(state: &InstallationState) -> Result<(), InstallError> {
        if stages::is_valid_prefix(state) {
            return Ok(());
        }
        let done: Vec<String> = state.stages_completed.iter().map(ToString::to_string).collect();
        Err(InstallError::ConfigurationMismatch(format!(
            "completed stages [{}] do not match the {} {} stage list",
            done.join(", "),
            state.target,
            state.mode
        )))
    }

    fn require_privilege(&self) -> Result<(), InstallError> {
        if self.caps.host.is_privileged() {
            Ok(())
        } else {
            Err(InstallError::PermissionDenied(
                "the installer must run as root".to_string(),
            ))
        }
    }

    /// Perform one step of the installation.
    ///
    /// # Errors
    ///
    /// Returns the stage's error once it is not retryable or retries are exhausted.
    pub async fn advance(&self, state: &mut InstallationState) -> Result<Outcome, InstallError> {
        Self::check_prefix(state)?;
        if state.is_complete() {
            return Ok(Outcome::Complete);
        }

        if let Some(after) = state.pending_reboot_for {
            let current = self.caps.host.boot_id()?;
            if state.boot_id.as_deref() == Some(current.as_str()) {
                info!(stage = %after, "Still waiting for a reboot");
                return Ok(Outcome::RebootRequired {
                    after,
                    already_pending: true,
                });
            }
            info!(stage = %after, "Reboot observed, resuming");
            state.clear_pending_reboot();
            self.store.save(state)?;
        }

        let Some(stage) = stages::next_stage(state) else {
            state.mark_complete();
            self.store.save(state)?;
            if let Err(e) = self.caps.rebooter.clear_resume(state.target).await {
                warn!(error = %e, "Failed to remove resume registration");
            }
            info!(target = %state.target, "Installation complete");
            return Ok(Outcome::Complete);
        };

        self.require_privilege()?;

        // Retries are budgeted per invocation; the persisted count is diagnostic.
        let mut attempts = 0;
        loop {
            info!(stage = %stage.id, attempt = state.attempt_count + 1, "{}", stage.id.description());
            match self.execute(stage.id, state).await {
                Ok(()) => break,
                Err(e) => {
                    let e = e.in_stage(stage.id);
                    attempts += 1;
                    state.record_failure(stage.id, &e);
                    self.store.save(state)?;

                    if e.is_transient() && self.retry.should_retry(attempts) {
                        let delay = self.retry.delay_for_attempt(attempts - 1);
                        warn!(
                            stage = %stage.id,
                            attempt = state.attempt_count,
                            error = %e,
                            delay_secs = delay.as_secs(),
                            "Transient error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(stage = %stage.id, error = %e, "Stage failed");
                    return Err(e);
                }
            }
        }

        state.record_completion(stage.id);
        if stage.requires_reboot {
            state.mark_reboot_pending(stage.id, self.caps.host.boot_id()?);
            self.store.save(state)?;
            if let Some(command) = &self.resume_command {
                self.caps
                    .rebooter
                    .register_resume(state.target, command)
                    .await?;
            }
            info!(stage = %stage.id, "Reboot required");
            return Ok(Outcome::RebootRequired {
                after: stage.id,
                already_pending: false,
            });
        }

        self.store.save(state)?;
        Ok(Outcome::Continue)
    }

    async fn multiregion(&self) -> &'static str {
        if let Some(zone) = self.caps.host.zone().await {
            return multiregion_for(&zone);
        }
        warn!(fallback = FALLBACK_MULTIREGION, "Zone unknown, using fallback mirror");
        FALLBACK_MULTIREGION
    }

    async fn execute(&self, id: StageId, state: &InstallationState) -> Result<(), InstallError> {
        let caps = &self.caps;
        let release = release_for(state.branch);

        match id {
            StageId::PreFlight => {
                info!(platform = %caps.installer.platform(), "Platform supported");
                let gpu = caps.gpu.detect_gpu().await?;
                if gpu.present {
                    info!(device = ?gpu.device_id, "NVIDIA GPU detected");
                } else if state.ignore_no_gpu {
                    warn!("No NVIDIA GPU detected, continuing as requested");
                } else {
                    return Err(InstallError::NoGpuDetected);
                }
            }
            StageId::Prerequisites => caps.installer.install_prerequisites().await?,
            StageId::ConfigureRepository => {
                let region = self.multiregion().await;
                caps.installer.configure_repository(region).await?;
            }
            StageId::InstallPackages => match state.target {
                Target::Driver => {
                    caps.installer.install_prerequisites().await?;
                    caps.installer
                        .install_driver_packages(&release.driver)
                        .await?;
                    caps.installer.lock_kernel().await?;
                }
                Target::Cuda => {
                    caps.installer
                        .install_toolkit_packages(&release.toolkit)
                        .await?;
                }
            },
            StageId::DownloadDriver => {
                let artifact = driver_artifact(self.multiregion().await, state.branch);
                caps.fetcher.fetch(&artifact, &self.work_dir).await?;
            }
            StageId::InstallDriver => {
                if caps.gpu.driver_installed().await? {
                    info!("GPU driver already installed");
                    return Ok(());
                }
                let artifact = driver_artifact(self.multiregion().await, state.branch);
                let installer = caps.fetcher.fetch(&artifact, &self.work_dir).await?;
                caps.installer
                    .run_driver_installer(&installer, state.secure_boot.as_ref())
                    .await?;
            }
            StageId::SignModules => {
                if let Some(keys) = &state.secure_boot {
                    caps.signer.sign_modules(keys).await?;
                }
            }
            StageId::LockKernel => caps.installer.lock_kernel().await?,
            StageId::CheckDriver => {
                if !caps.gpu.driver_installed().await? {
                    if !state.ignore_no_gpu {
                        return Err(InstallError::StageFailed {
                            stage: id,
                            reason: "the GPU driver is not installed; run install_driver first"
                                .to_string(),
                        });
                    }
                    warn!("GPU driver not detected, continuing as requested");
                }
            }
            StageId::DownloadToolkit => {
                let artifact = toolkit_artifact(self.multiregion().await, state.branch);
                caps.fetcher.fetch(&artifact, &self.work_dir).await?;
            }
            StageId::InstallToolkit => {
                if caps.gpu.toolkit_installed(&release.toolkit).await? {
                    info!("CUDA Toolkit already installed");
                    return Ok(());
                }
                let artifact = toolkit_artifact(self.multiregion().await, state.branch);
                let installer = caps.fetcher.fetch(&artifact, &self.work_dir).await?;
                caps.installer.run_toolkit_installer(&installer).await?;
            }
            StageId::PostInstall => {
                caps.installer
                    .configure_toolkit_environment(&release.toolkit)
                    .await?;
            }
            StageId::Reboot => {}
            StageId::Verify => {
                let report =
                    verify::verify(caps.gpu.as_ref(), state.target, state.branch, None).await?;
                if !report.is_installed() {
                    if !state.ignore_no_gpu {
                        return Err(InstallError::StageFailed {
                            stage: id,
                            reason: format!("{} is not working after installation", state.target),
                        });
                    }
                    warn!("Verification failed, tolerated because the GPU check is ignored");
                }
            }
        }
        Ok(())
    }
}
