//! Linux distribution detection from `/etc/os-release`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::InstallError;

/// Supported distribution families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroId {
    Debian,
    Ubuntu,
    Rhel,
    Rocky,
}

/// Package manager family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFamily {
    Apt,
    Dnf,
}

/// A detected, supported distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distro {
    pub id: DistroId,
    /// `VERSION_ID` as published, e.g. `22.04`, `9.4`, `12`.
    pub version: String,
}

impl Distro {
    /// Read and parse `/etc/os-release`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::UnsupportedPlatform`] for anything outside the supported set.
    pub fn detect() -> Result<Self, InstallError> {
        if !cfg!(target_os = "linux") {
            return Err(InstallError::UnsupportedPlatform(format!(
                "{} is not supported, only Linux",
                std::env::consts::OS
            )));
        }
        let path = Path::new("/etc/os-release");
        let content = std::fs::read_to_string(path).map_err(|e| {
            InstallError::UnsupportedPlatform(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse `os-release` content.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::UnsupportedPlatform`] for unknown distributions or versions.
    pub fn parse(content: &str) -> Result<Self, InstallError> {
        let fields: HashMap<&str, &str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim().trim_matches(|c| c == '"' || c == '\'')))
            .collect();

        let raw_id = fields.get("ID").copied().unwrap_or_default();
        let version = fields.get("VERSION_ID").copied().unwrap_or_default().to_string();

        let id = match raw_id {
            "debian" => DistroId::Debian,
            "ubuntu" => DistroId::Ubuntu,
            "rhel" => DistroId::Rhel,
            "rocky" => DistroId::Rocky,
            other => {
                let name = fields.get("PRETTY_NAME").copied().unwrap_or(other);
                return Err(InstallError::UnsupportedPlatform(format!(
                    "{name} is not supported"
                )));
            }
        };

        let distro = Self { id, version };
        if !distro.is_supported_version() {
            return Err(InstallError::UnsupportedPlatform(format!(
                "{distro} is not supported"
            )));
        }
        Ok(distro)
    }

    fn is_supported_version(&self) -> bool {
        match self.id {
            DistroId::Debian => self.major() == "12",
            DistroId::Ubuntu => matches!(self.version.as_str(), "22.04" | "24.04"),
            DistroId::Rhel | DistroId::Rocky => matches!(self.major(), "8" | "9"),
        }
    }

    /// Major version (`9` for `9.4`).
    #[must_use]
    pub fn major(&self) -> &str {
        self.version.split('.').next().unwrap_or(&self.version)
    }

    #[must_use]
    pub fn family(&self) -> PackageFamily {
        match self.id {
            DistroId::Debian | DistroId::Ubuntu => PackageFamily::Apt,
            DistroId::Rhel | DistroId::Rocky => PackageFamily::Dnf,
        }
    }

    /// Repository path component, e.g. (`ubuntu`, `2204`).
    #[must_use]
    pub fn repo_id(&self) -> (&'static str, String) {
        match self.id {
            DistroId::Debian => ("debian", self.major().to_string()),
            DistroId::Ubuntu => ("ubuntu", self.version.replace('.', "")),
            DistroId::Rhel => ("rhel", self.major().to_string()),
            DistroId::Rocky => ("rocky", self.major().to_string()),
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.id {
            DistroId::Debian => "Debian",
            DistroId::Ubuntu => "Ubuntu",
            DistroId::Rhel => "Red Hat Enterprise Linux",
            DistroId::Rocky => "Rocky Linux",
        };
        write!(f, "{name} {}", self.version)
    }
}
