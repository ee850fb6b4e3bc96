//! Installation state persistence.
//!
//! One JSON file per target lives in the installer directory. The file is the
//! only thing that survives a reboot, so every transition is written to disk
//! before the state machine acts on it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Branch, InstallMode, InstallRequest, SecureBootKeys, Target};
use crate::error::{ErrorKind, InstallError};
use crate::stages::StageId;

/// Current on-disk schema version.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Last failure, kept for the next invocation's diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: StageId,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Persisted installation progress for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationState {
    pub schema_version: u32,
    pub target: Target,
    pub branch: Branch,
    pub mode: InstallMode,
    /// Completed stages, in completion order.
    pub stages_completed: Vec<StageId>,
    /// Stage whose reboot has not been observed yet.
    pub pending_reboot_for: Option<StageId>,
    /// Boot id recorded when `pending_reboot_for` was set.
    #[serde(default)]
    pub boot_id: Option<String>,
    pub ignore_no_gpu: bool,
    pub secure_boot: Option<SecureBootKeys>,
    /// Failed attempts of the current stage.
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once every stage has completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl InstallationState {
    /// Fresh state for a request.
    #[must_use]
    pub fn new(request: &InstallRequest) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            target: request.target,
            branch: request.branch,
            mode: request.mode,
            stages_completed: Vec::new(),
            pending_reboot_for: None,
            boot_id: None,
            ignore_no_gpu: request.ignore_no_gpu,
            secure_boot: request.secure_boot.clone(),
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Check if the installation reached terminal success.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Ensure an in-flight state was started with the same parameters.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::ConfigurationMismatch`] naming the first differing field.
    pub fn check_request(&self, request: &InstallRequest) -> Result<(), InstallError> {
        let mismatch = |field: &str, persisted: String, requested: String| {
            Err(InstallError::ConfigurationMismatch(format!(
                "{field} is '{persisted}' in the {} installation in progress but '{requested}' was requested; \
                 run `reset --target {}` to start over",
                self.target, self.target
            )))
        };

        if self.target != request.target {
            return mismatch("target", self.target.to_string(), request.target.to_string());
        }
        if self.branch != request.branch {
            return mismatch("branch", self.branch.to_string(), request.branch.to_string());
        }
        if self.mode != request.mode {
            return mismatch("mode", self.mode.to_string(), request.mode.to_string());
        }
        if self.ignore_no_gpu != request.ignore_no_gpu {
            return mismatch(
                "ignore-no-gpu",
                self.ignore_no_gpu.to_string(),
                request.ignore_no_gpu.to_string(),
            );
        }
        if self.secure_boot != request.secure_boot {
            let show = |k: &Option<SecureBootKeys>| {
                k.as_ref()
                    .map_or_else(|| "none".to_string(), |k| k.public_key.display().to_string())
            };
            return mismatch(
                "secure boot keys",
                show(&self.secure_boot),
                show(&request.secure_boot),
            );
        }
        Ok(())
    }

    /// Append a completed stage and reset the attempt counter.
    pub fn record_completion(&mut self, stage: StageId) {
        if !self.stages_completed.contains(&stage) {
            self.stages_completed.push(stage);
        }
        self.attempt_count = 0;
        self.last_error = None;
    }

    /// Record a failed attempt of a stage.
    pub fn record_failure(&mut self, stage: StageId, error: &InstallError) {
        self.attempt_count += 1;
        self.last_error = Some(FailureRecord {
            stage,
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    /// Suspend until the host has rebooted.
    pub fn mark_reboot_pending(&mut self, stage: StageId, boot_id: String) {
        self.pending_reboot_for = Some(stage);
        self.boot_id = Some(boot_id);
    }

    /// Resume after an observed reboot.
    pub fn clear_pending_reboot(&mut self) {
        self.pending_reboot_for = None;
        self.boot_id = None;
    }

    /// Mark terminal success.
    pub fn mark_complete(&mut self) {
        self.completed_at = Some(Utc::now());
        self.pending_reboot_for = None;
        self.last_error = None;
    }
}

/// Directory-backed store of per-target state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the state files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the state file path for a target.
    #[must_use]
    pub fn state_file(&self, target: Target) -> PathBuf {
        self.dir.join(format!("{target}-state.json"))
    }

    fn lock_file(&self, target: Target) -> PathBuf {
        self.dir.join(format!("{target}.lock"))
    }

    /// Load state for a target if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self, target: Target) -> Result<Option<InstallationState>, InstallError> {
        let path = self.state_file(target);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        let state: InstallationState =
            serde_json::from_str(&content).map_err(|e| InstallError::CorruptState {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(InstallError::CorruptState {
                path: path.display().to_string(),
                message: format!("unsupported schema version {}", state.schema_version),
            });
        }

        debug!(
            target = %target,
            completed = state.stages_completed.len(),
            pending_reboot = ?state.pending_reboot_for,
            attempt = state.attempt_count,
            "Loaded installation state"
        );
        Ok(Some(state))
    }

    /// Save state, replacing the previous file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, state: &mut InstallationState) -> Result<(), InstallError> {
        state.updated_at = Utc::now();
        fs::create_dir_all(&self.dir)?;

        let path = self.state_file(state.target);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Move the state file aside so the next invocation starts fresh.
    ///
    /// Returns the archive path, or `None` if there was no state.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be renamed.
    pub fn archive(&self, target: Target) -> Result<Option<PathBuf>, InstallError> {
        let path = self.state_file(target);
        if !path.exists() {
            return Ok(None);
        }
        let archived = self.dir.join(format!(
            "{target}-state.{}.json",
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        fs::rename(&path, &archived)?;
        info!(target = %target, archive = %archived.display(), "Archived installation state");
        Ok(Some(archived))
    }

    /// Take the per-target lock.
    ///
    /// A lock left behind by a process from an earlier boot, or by a process
    /// that no longer exists, is reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::AlreadyInProgress`] if another live invocation holds it.
    pub fn lock(&self, target: Target, boot_id: &str) -> Result<StateLock, InstallError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_file(target);
        let owner = LockOwner {
            pid: std::process::id(),
            boot_id: boot_id.to_string(),
        };

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(serde_json::to_string(&owner)?.as_bytes())?;
                    return Ok(StateLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| serde_json::from_str::<LockOwner>(&s).ok());
                    match holder {
                        Some(h) if h.boot_id == boot_id && h.is_alive() => {
                            return Err(InstallError::AlreadyInProgress { target, pid: h.pid });
                        }
                        _ => {
                            warn!(lock = %path.display(), "Removing stale installer lock");
                            fs::remove_file(&path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(InstallError::AlreadyInProgress {
            target,
            pid: 0,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    boot_id: String,
}

impl LockOwner {
    fn is_alive(&self) -> bool {
        Path::new("/proc").join(self.pid.to_string()).exists()
    }
}

/// Held per-target lock; released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release installer lock");
        }
    }
}

/// Retry configuration for transient stage failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per stage.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate the delay for a given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry given the current attempt count.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
