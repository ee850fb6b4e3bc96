//! Installation parameters and static release tables.
//!
//! Everything the installer downloads is pinned here: driver and toolkit
//! releases per branch, their checksums, and the regional mirror layout.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::InstallError;

/// Default directory holding state files, downloads and the log file.
pub const INSTALLER_DIR: &str = "/opt/google/cuda-installer";

/// Installer release uploaded to the mirrors (used by the image builder bootstrap).
pub const INSTALLER_VERSION: &str = "v1.7.0";

/// Region used when the zone is unknown or its prefix is not mapped.
pub const FALLBACK_MULTIREGION: &str = "us";

/// Zone/region prefix to multi-region mapping for mirror selection.
const MULTIREGION_TABLE: &[(&str, &str)] = &[
    ("africa", "eu"),
    ("asia", "asia"),
    ("australia", "asia"),
    ("europe", "eu"),
    ("me", "eu"),
    ("northamerica", "us"),
    ("southamerica", "us"),
    ("us", "us"),
];

/// Translate a region or zone (`europe-central2`, `us-central1-a`) to the
/// multi-region that hosts its mirror bucket (`eu`, `us`).
#[must_use]
pub fn multiregion_for(region_or_zone: &str) -> &'static str {
    let prefix = region_or_zone.split('-').next().unwrap_or_default();
    MULTIREGION_TABLE
        .iter()
        .find(|(p, _)| *p == prefix)
        .map_or(FALLBACK_MULTIREGION, |(_, multi)| multi)
}

/// What is being installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The NVIDIA kernel driver.
    Driver,
    /// The CUDA Toolkit (requires the driver).
    Cuda,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Driver => write!(f, "driver"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// NVIDIA release track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Branch {
    /// Production branch.
    #[default]
    #[serde(rename = "prod")]
    Production,
    /// New feature branch.
    #[serde(rename = "nfb")]
    NewFeature,
    /// Long term support branch.
    #[serde(rename = "lts")]
    LongTermSupport,
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "prod"),
            Self::NewFeature => write!(f, "nfb"),
            Self::LongTermSupport => write!(f, "lts"),
        }
    }
}

impl std::str::FromStr for Branch {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Ok(Self::Production),
            "nfb" | "new-feature" => Ok(Self::NewFeature),
            "lts" | "long-term-support" => Ok(Self::LongTermSupport),
            _ => Err(InstallError::InvalidArgument(format!(
                "Unknown branch: {s}. Supported: prod, nfb, lts"
            ))),
        }
    }
}

/// How the driver/toolkit gets onto the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    /// NVIDIA `.run` installers downloaded from the mirror.
    #[default]
    Binary,
    /// Packages from the NVIDIA distribution repository.
    #[serde(rename = "repo")]
    Repository,
}

impl std::fmt::Display for InstallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Repository => write!(f, "repo"),
        }
    }
}

impl std::str::FromStr for InstallMode {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "repo" | "repository" => Ok(Self::Repository),
            _ => Err(InstallError::InvalidArgument(format!(
                "Unknown installation mode: {s}. Supported: binary, repo"
            ))),
        }
    }
}

/// Paths to the key pair used to sign kernel modules for Secure Boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureBootKeys {
    /// DER encoded public certificate.
    pub public_key: PathBuf,
    /// PEM encoded private key.
    pub private_key: PathBuf,
}

/// A pinned driver release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverRelease {
    /// Full version, e.g. `580.82.07`.
    pub version: &'static str,
    /// SHA-256 of the `.run` installer.
    pub sha256: &'static str,
}

impl DriverRelease {
    /// Major version used for repository package names (`580`).
    #[must_use]
    pub fn major(&self) -> &'static str {
        self.version.split('.').next().unwrap_or(self.version)
    }
}

/// A pinned CUDA Toolkit release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolkitRelease {
    pub major: &'static str,
    pub minor: &'static str,
    pub patch: &'static str,
    /// Driver version bundled with the toolkit installer.
    pub driver: &'static str,
    /// SHA-256 of the `.run` installer.
    pub sha256: &'static str,
    /// `cuda-samples` tag used to check the toolkit, e.g. `13.0`.
    pub samples: &'static str,
    pub samples_sha256: &'static str,
}

impl ToolkitRelease {
    /// Install prefix, e.g. `/usr/local/cuda-13.0`.
    #[must_use]
    pub fn prefix(&self) -> PathBuf {
        PathBuf::from(format!("/usr/local/cuda-{}.{}", self.major, self.minor))
    }

    /// Directory with `nvcc` and friends.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.prefix().join("bin")
    }

    /// Directory with the shared libraries.
    #[must_use]
    pub fn lib_dir(&self) -> PathBuf {
        self.prefix().join("lib64")
    }

    /// Repository package name, e.g. `cuda-toolkit-13-0`.
    #[must_use]
    pub fn package(&self) -> String {
        format!("cuda-toolkit-{}-{}", self.major, self.minor)
    }
}

/// Driver and toolkit pinned for one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRelease {
    pub driver: DriverRelease,
    pub toolkit: ToolkitRelease,
}

const PROD_DRIVER: DriverRelease = DriverRelease {
    version: "580.82.07",
    sha256: "061e48e11fe552232095811d0b1cea9b718ba2540d605074ff227fce0628798c",
};

const PROD_TOOLKIT: ToolkitRelease = ToolkitRelease {
    major: "13",
    minor: "0",
    patch: "1",
    driver: "580.82.07",
    sha256: "4c7ac59d1f41d67be27d140a4622801738ad71088570a0facfd6ec878a4c4100",
    samples: "13.0",
    samples_sha256: "63cc9d5d8280c87df3c1f4e2276234a0f42cc497c52b40dd5bdda2836607db79",
};

/// Release pinned for a branch.
#[must_use]
pub fn release_for(branch: Branch) -> BranchRelease {
    match branch {
        Branch::Production | Branch::LongTermSupport => BranchRelease {
            driver: PROD_DRIVER,
            toolkit: PROD_TOOLKIT,
        },
        Branch::NewFeature => BranchRelease {
            driver: DriverRelease {
                version: "575.57.08",
                sha256: "2aa701dac180a7b20a6e578cccd901ded8d44e57d60580f08f9d28dd1fffc6f2",
            },
            toolkit: ToolkitRelease {
                major: "12",
                minor: "9",
                patch: "1",
                driver: "575.57.08",
                sha256: "0f6d806ddd87230d2adbe8a6006a9d20144fdbda9de2d6acc677daa5d036417a",
                samples: "12.9",
                samples_sha256: "2e67e1f6bdb15bf11b21e07e988e2f9f60fb054eff51ef01cebdd47229788015",
            },
        },
    }
}

/// A file to fetch from a mirror, with the checksum it must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    pub sha256: String,
}

impl Artifact {
    /// Last path segment of the URL.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

/// Base URL of the regional mirror bucket.
#[must_use]
pub fn mirror_base(multiregion: &str) -> String {
    format!("https://storage.googleapis.com/compute-gpu-installation-{multiregion}")
}

/// Driver `.run` installer for a branch.
#[must_use]
pub fn driver_artifact(multiregion: &str, branch: Branch) -> Artifact {
    let driver = release_for(branch).driver;
    Artifact {
        url: format!(
            "{}/drivers/NVIDIA-Linux-x86_64-{}.run",
            mirror_base(multiregion),
            driver.version
        ),
        sha256: driver.sha256.to_string(),
    }
}

/// CUDA Toolkit `.run` installer for a branch.
#[must_use]
pub fn toolkit_artifact(multiregion: &str, branch: Branch) -> Artifact {
    let tk = release_for(branch).toolkit;
    Artifact {
        url: format!(
            "{}/cuda_toolkits/cuda_{}.{}.{}_{}_linux.run",
            mirror_base(multiregion),
            tk.major,
            tk.minor,
            tk.patch,
            tk.driver
        ),
        sha256: tk.sha256.to_string(),
    }
}

/// `cuda-samples` source archive matching a branch's toolkit.
#[must_use]
pub fn samples_artifact(multiregion: &str, branch: Branch) -> Artifact {
    let tk = release_for(branch).toolkit;
    Artifact {
        url: format!("{}/cuda_samples/v{}.tar.gz", mirror_base(multiregion), tk.samples),
        sha256: tk.samples_sha256.to_string(),
    }
}

/// NVIDIA apt keyring package for a distro (`ubuntu`, `2204`), if published.
#[must_use]
pub fn deb_keyring_artifact(multiregion: &str, system: &str, version: &str) -> Option<Artifact> {
    let sha256 = match (system, version) {
        ("ubuntu", "2004") => "cf5ca9853118b9fb2b78dd2708786e1eb5ab14e39d8738539281429428eb4efe",
        ("ubuntu", "2204") => "d93190d50b98ad4699ff40f4f7af50f16a76dac3bb8da1eaaf366d47898ff8df",
        ("ubuntu", "2404") => "d2a6b11c096396d868758b86dab1823b25e14d70333f1dfa74da5ddaf6a06dba",
        ("debian", "12") => "e7f219eab6fe4819cdb5c15b98233dc3420302d9c00883219cd3d896857cf48d",
        _ => return None,
    };
    Some(Artifact {
        url: format!(
            "{}/repos/{system}{version}/x86_64/cuda-keyring_1.1-1_all.deb",
            mirror_base(multiregion)
        ),
        sha256: sha256.to_string(),
    })
}

/// NVIDIA dnf repository definition for a RHEL major version.
#[must_use]
pub fn rhel_repo_url(major_version: &str) -> String {
    format!(
        "https://developer.download.nvidia.com/compute/cuda/repos/rhel{major_version}/x86_64/cuda-rhel{major_version}.repo"
    )
}

/// Shell profile exporting the toolkit paths for every user.
pub const CUDA_PROFILE_FILE: &str = "/etc/profile.d/google_cuda_install.sh";

/// Archive shipped with the driver that installs the persistence daemon service.
pub const PERSISTENCED_INSTALLER: &str =
    "/usr/share/doc/NVIDIA_GLX-1.0/samples/nvidia-persistenced-init.tar.bz2";

/// Parameters of one `install_driver` / `install_cuda` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub target: Target,
    pub branch: Branch,
    pub mode: InstallMode,
    pub ignore_no_gpu: bool,
    pub secure_boot: Option<SecureBootKeys>,
}

impl InstallRequest {
    /// Request with default branch and mode.
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            branch: Branch::default(),
            mode: InstallMode::default(),
            ignore_no_gpu: false,
            secure_boot: None,
        }
    }

    #[must_use]
    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branch = branch;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: InstallMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_ignore_no_gpu(mut self, ignore: bool) -> Self {
        self.ignore_no_gpu = ignore;
        self
    }

    #[must_use]
    pub fn with_secure_boot(mut self, keys: Option<SecureBootKeys>) -> Self {
        self.secure_boot = keys;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiregion_mapping() {
        assert_eq!(multiregion_for("us-central1"), "us");
        assert_eq!(multiregion_for("us-central1-a"), "us");
        assert_eq!(multiregion_for("europe-west4"), "eu");
        assert_eq!(multiregion_for("asia-southeast1"), "asia");
        assert_eq!(multiregion_for("australia-southeast1-b"), "asia");
        assert_eq!(multiregion_for("me-west1"), "eu");
        assert_eq!(multiregion_for("northamerica-northeast1"), "us");
    }

    #[test]
    fn test_multiregion_fallback() {
        assert_eq!(multiregion_for("mars-north1"), FALLBACK_MULTIREGION);
        assert_eq!(multiregion_for(""), "us");
    }

    #[test]
    fn test_branch_parsing() {
        assert_eq!("prod".parse::<Branch>().unwrap(), Branch::Production);
        assert_eq!("NFB".parse::<Branch>().unwrap(), Branch::NewFeature);
        assert_eq!("lts".parse::<Branch>().unwrap(), Branch::LongTermSupport);
        assert!("beta".parse::<Branch>().is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("repo".parse::<InstallMode>().unwrap(), InstallMode::Repository);
        assert_eq!("binary".parse::<InstallMode>().unwrap(), InstallMode::Binary);
        assert!("snap".parse::<InstallMode>().is_err());
    }

    #[test]
    fn test_artifact_urls() {
        let driver = driver_artifact("eu", Branch::Production);
        assert_eq!(
            driver.url,
            "https://storage.googleapis.com/compute-gpu-installation-eu/drivers/NVIDIA-Linux-x86_64-580.82.07.run"
        );
        assert_eq!(driver.file_name(), "NVIDIA-Linux-x86_64-580.82.07.run");

        let toolkit = toolkit_artifact("us", Branch::NewFeature);
        assert!(toolkit.url.ends_with("/cuda_toolkits/cuda_12.9.1_575.57.08_linux.run"));

        let samples = samples_artifact("asia", Branch::LongTermSupport);
        assert_eq!(
            samples.url,
            "https://storage.googleapis.com/compute-gpu-installation-asia/cuda_samples/v13.0.tar.gz"
        );
        assert_eq!(samples.file_name(), "v13.0.tar.gz");
        assert!(samples_artifact("us", Branch::NewFeature).url.ends_with("/v12.9.tar.gz"));
        assert_ne!(
            samples_artifact("us", Branch::NewFeature).sha256,
            samples.sha256
        );
    }

    #[test]
    fn test_toolkit_paths() {
        let tk = release_for(Branch::Production).toolkit;
        assert_eq!(tk.bin_dir(), PathBuf::from("/usr/local/cuda-13.0/bin"));
        assert_eq!(tk.package(), "cuda-toolkit-13-0");
        assert_eq!(release_for(Branch::Production).driver.major(), "580");
    }

    #[test]
    fn test_keyring_lookup() {
        assert!(deb_keyring_artifact("us", "ubuntu", "2204").is_some());
        assert!(deb_keyring_artifact("us", "debian", "13").is_none());
    }
}
