//! Build configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use gpu_installer::config::{multiregion_for, Branch, InstallMode, INSTALLER_VERSION};
use gpu_installer::SecureBootKeys;

use crate::error::BuildError;

/// Base OS images the builder knows how to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseImage {
    Debian12,
    Rhel8,
    Rhel9,
    Rocky8,
    Rocky9,
    Ubuntu22,
    Ubuntu24,
}

impl BaseImage {
    pub const ALL: [Self; 7] = [
        Self::Debian12,
        Self::Rhel8,
        Self::Rhel9,
        Self::Rocky8,
        Self::Rocky9,
        Self::Ubuntu22,
        Self::Ubuntu24,
    ];

    /// Short name used on the command line and in resource names.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Debian12 => "debian-12",
            Self::Rhel8 => "rhel-8",
            Self::Rhel9 => "rhel-9",
            Self::Rocky8 => "rocky-8",
            Self::Rocky9 => "rocky-9",
            Self::Ubuntu22 => "ubuntu-22",
            Self::Ubuntu24 => "ubuntu-24",
        }
    }

    /// Public image family.
    #[must_use]
    pub fn image_family(self) -> &'static str {
        match self {
            Self::Debian12 => "debian-12",
            Self::Rhel8 => "rhel-8",
            Self::Rhel9 => "rhel-9",
            Self::Rocky8 => "rocky-linux-8",
            Self::Rocky9 => "rocky-linux-9",
            Self::Ubuntu22 => "ubuntu-2204-lts",
            Self::Ubuntu24 => "ubuntu-2404-lts-amd64",
        }
    }

    /// Project hosting the image family.
    #[must_use]
    pub fn image_project(self) -> &'static str {
        match self {
            Self::Debian12 => "debian-cloud",
            Self::Rhel8 | Self::Rhel9 => "rhel-cloud",
            Self::Rocky8 | Self::Rocky9 => "rocky-linux-cloud",
            Self::Ubuntu22 | Self::Ubuntu24 => "ubuntu-os-cloud",
        }
    }
}

impl std::fmt::Display for BaseImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BaseImage {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|b| b.name()).collect();
                BuildError::invalid_config(format!(
                    "Unknown base image: {s}. Supported: {}",
                    known.join(", ")
                ))
            })
    }
}

/// Boot disk type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskType {
    Ssd,
    #[default]
    Balanced,
    Standard,
}

impl DiskType {
    /// Compute Engine disk type.
    #[must_use]
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Ssd => "pd-ssd",
            Self::Balanced => "pd-balanced",
            Self::Standard => "pd-standard",
        }
    }
}

impl FromStr for DiskType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssd" => Ok(Self::Ssd),
            "balanced" => Ok(Self::Balanced),
            "standard" => Ok(Self::Standard),
            _ => Err(BuildError::invalid_config(format!(
                "Unknown disk type: {s}. Supported: ssd, balanced, standard"
            ))),
        }
    }
}

/// Where the Secure Boot signing keys come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Use an existing key pair.
    Existing(SecureBootKeys),
    /// Generate a pair, optionally keeping it in a directory.
    Generate { keep_in: Option<PathBuf> },
}

/// Serial console polling parameters.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Give up waiting for the completion signal after this long.
    pub signal_timeout: Duration,
    /// Give up waiting for the instance to power off after this long.
    pub shutdown_timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            signal_timeout: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(10 * 60),
            initial_interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollConfig {
    /// Next interval after `current`.
    #[must_use]
    pub fn next_interval(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.backoff_multiplier)
            .min(self.max_interval)
    }
}

/// Everything needed to bake one image.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub project: String,
    /// Zone of the build instance.
    pub zone: String,
    pub base_image: BaseImage,
    pub mode: InstallMode,
    pub branch: Branch,
    /// Skip the CUDA Toolkit.
    pub driver_only: bool,
    pub machine_type: String,
    pub disk_type: DiskType,
    pub disk_size_gb: u32,
    pub image_name: String,
    pub image_family: Option<String>,
    /// Image storage location; derived from the zone when unset.
    pub image_region: Option<String>,
    pub keys: KeySource,
    pub custom_script: Option<PathBuf>,
    /// Hand the instance to an operator before capture.
    pub interactive: bool,
    pub network: String,
    pub subnet: Option<String>,
    /// Keep the build instance and disk, even on success.
    pub skip_cleanup: bool,
    pub poll: PollConfig,
    pub installer_version: String,
}

impl BuildConfig {
    /// Configuration with defaults for everything but the required fields.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        base_image: BaseImage,
        image_name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            base_image,
            mode: InstallMode::Binary,
            branch: Branch::Production,
            driver_only: false,
            machine_type: "g2-standard-4".to_string(),
            disk_type: DiskType::Balanced,
            disk_size_gb: 30,
            image_name: image_name.into(),
            image_family: None,
            image_region: None,
            keys: KeySource::Generate { keep_in: None },
            custom_script: None,
            interactive: false,
            network: "default".to_string(),
            subnet: None,
            skip_cleanup: false,
            poll: PollConfig::default(),
            installer_version: INSTALLER_VERSION.to_string(),
        }
    }

    /// Multi-region of the mirror closest to the build zone.
    #[must_use]
    pub fn mirror_region(&self) -> &'static str {
        multiregion_for(&self.zone)
    }

    /// Where the image is stored: explicit, or the build zone's multi-region.
    #[must_use]
    pub fn storage_region(&self) -> String {
        self.image_region
            .clone()
            .unwrap_or_else(|| self.mirror_region().to_string())
    }

    #[must_use]
    pub fn subnet(&self) -> &str {
        self.subnet.as_deref().unwrap_or(&self.network)
    }

    /// Reject configurations before any cloud resource exists.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfig` [`BuildError`] describing the first problem.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.project.trim().is_empty() {
            return Err(BuildError::invalid_config("a project is required"));
        }
        if self.zone.trim().is_empty() {
            return Err(BuildError::invalid_config("a build zone is required"));
        }
        if self.image_name.trim().is_empty() {
            return Err(BuildError::invalid_config("an image name is required"));
        }
        if self.base_image == BaseImage::Debian12
            && self.mode == InstallMode::Repository
            && self.branch == Branch::Production
        {
            return Err(BuildError::invalid_config(
                "Production branch is not supported in 'repo' mode for Debian 12",
            ));
        }
        if self.disk_size_gb < 10 {
            return Err(BuildError::invalid_config(format!(
                "disk size {} GB is too small",
                self.disk_size_gb
            )));
        }
        if let Some(script) = &self.custom_script {
            if !script.is_file() {
                return Err(BuildError::invalid_config(format!(
                    "The file {} does not exist or is not a file",
                    script.display()
                )));
            }
        }
        if let KeySource::Existing(keys) = &self.keys {
            for key in [&keys.public_key, &keys.private_key] {
                if !key.is_file() {
                    return Err(BuildError::invalid_config(format!(
                        "{} does not exist or is not a file",
                        key.display()
                    )));
                }
            }
        }
        Ok(())
    }
}
