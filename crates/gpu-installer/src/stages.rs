//! Stage registry.
//!
//! Each `(target, mode)` pair has a statically declared, ordered list of
//! stages. The state machine walks that list; nothing else decides order.

use serde::{Deserialize, Serialize};

use crate::config::{InstallMode, Target};
use crate::state::InstallationState;

/// Identifier of an installation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Platform and GPU checks.
    PreFlight,
    /// Kernel headers, compilers, dkms and a kernel update.
    Prerequisites,
    /// NVIDIA package repository.
    ConfigureRepository,
    /// Driver or toolkit packages from the repository.
    InstallPackages,
    /// Fetch the driver `.run` installer.
    DownloadDriver,
    /// Run the driver `.run` installer.
    InstallDriver,
    /// Sign the installed kernel modules.
    SignModules,
    /// Hold kernel packages at the current version.
    LockKernel,
    /// The toolkit needs a working driver.
    CheckDriver,
    /// Fetch the toolkit `.run` installer.
    DownloadToolkit,
    /// Run the toolkit `.run` installer.
    InstallToolkit,
    /// Environment profile and persistence daemon.
    PostInstall,
    /// Reboot boundary with no action of its own.
    Reboot,
    /// Read-only verification pass.
    Verify,
}

impl StageId {
    /// Human-readable description for progress output.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::PreFlight => "Running pre-flight checks",
            Self::Prerequisites => "Installing prerequisites and updating kernel",
            Self::ConfigureRepository => "Configuring NVIDIA package repository",
            Self::InstallPackages => "Installing packages",
            Self::DownloadDriver => "Downloading driver installer",
            Self::InstallDriver => "Installing GPU driver",
            Self::SignModules => "Signing kernel modules for Secure Boot",
            Self::LockKernel => "Locking kernel updates",
            Self::CheckDriver => "Checking GPU driver",
            Self::DownloadToolkit => "Downloading CUDA Toolkit installer",
            Self::InstallToolkit => "Installing CUDA Toolkit",
            Self::PostInstall => "Running post-installation actions",
            Self::Reboot => "Rebooting",
            Self::Verify => "Verifying installation",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Same spelling as the state file.
        let s = match self {
            Self::PreFlight => "pre-flight",
            Self::Prerequisites => "prerequisites",
            Self::ConfigureRepository => "configure-repository",
            Self::InstallPackages => "install-packages",
            Self::DownloadDriver => "download-driver",
            Self::InstallDriver => "install-driver",
            Self::SignModules => "sign-modules",
            Self::LockKernel => "lock-kernel",
            Self::CheckDriver => "check-driver",
            Self::DownloadToolkit => "download-toolkit",
            Self::InstallToolkit => "install-toolkit",
            Self::PostInstall => "post-install",
            Self::Reboot => "reboot",
            Self::Verify => "verify",
        };
        write!(f, "{s}")
    }
}

/// One registry entry.
#[derive(Debug, Clone, Copy)]
pub struct Stage {
    pub id: StageId,
    /// The host must reboot before the next stage runs.
    pub requires_reboot: bool,
    /// Whether the stage is part of this installation at all.
    pub applies_when: fn(&InstallationState) -> bool,
}

fn always(_: &InstallationState) -> bool {
    true
}

fn secure_boot_requested(state: &InstallationState) -> bool {
    state.secure_boot.is_some()
}

const fn stage(id: StageId) -> Stage {
    Stage {
        id,
        requires_reboot: false,
        applies_when: always,
    }
}

const fn reboot_after(id: StageId) -> Stage {
    Stage {
        id,
        requires_reboot: true,
        applies_when: always,
    }
}

static DRIVER_BINARY: [Stage; 6] = [
    stage(StageId::PreFlight),
    reboot_after(StageId::Prerequisites),
    stage(StageId::DownloadDriver),
    stage(StageId::InstallDriver),
    stage(StageId::LockKernel),
    stage(StageId::Verify),
];

static DRIVER_REPOSITORY: [Stage; 6] = [
    stage(StageId::PreFlight),
    stage(StageId::ConfigureRepository),
    stage(StageId::InstallPackages),
    Stage {
        id: StageId::SignModules,
        requires_reboot: false,
        applies_when: secure_boot_requested,
    },
    reboot_after(StageId::Reboot),
    stage(StageId::Verify),
];

static CUDA_BINARY: [Stage; 7] = [
    stage(StageId::PreFlight),
    stage(StageId::CheckDriver),
    stage(StageId::DownloadToolkit),
    stage(StageId::InstallToolkit),
    stage(StageId::PostInstall),
    reboot_after(StageId::Reboot),
    stage(StageId::Verify),
];

static CUDA_REPOSITORY: [Stage; 7] = [
    stage(StageId::PreFlight),
    stage(StageId::CheckDriver),
    stage(StageId::ConfigureRepository),
    stage(StageId::InstallPackages),
    stage(StageId::PostInstall),
    reboot_after(StageId::Reboot),
    stage(StageId::Verify),
];

/// Full ordered registry for a target and mode.
#[must_use]
pub fn registry(target: Target, mode: InstallMode) -> &'static [Stage] {
    match (target, mode) {
        (Target::Driver, InstallMode::Binary) => &DRIVER_BINARY,
        (Target::Driver, InstallMode::Repository) => &DRIVER_REPOSITORY,
        (Target::Cuda, InstallMode::Binary) => &CUDA_BINARY,
        (Target::Cuda, InstallMode::Repository) => &CUDA_REPOSITORY,
    }
}

/// Registry entries whose predicate holds for this state, in order.
#[must_use]
pub fn applicable(state: &InstallationState) -> Vec<&'static Stage> {
    registry(state.target, state.mode)
        .iter()
        .filter(|s| (s.applies_when)(state))
        .collect()
}

/// Look up the registry entry for a stage id.
#[must_use]
pub fn find(target: Target, mode: InstallMode, id: StageId) -> Option<&'static Stage> {
    registry(target, mode).iter().find(|s| s.id == id)
}

/// First applicable stage not yet completed.
#[must_use]
pub fn next_stage(state: &InstallationState) -> Option<&'static Stage> {
    applicable(state)
        .into_iter()
        .find(|s| !state.stages_completed.contains(&s.id))
}

/// Whether the completed stages are a prefix of the applicable stage list.
#[must_use]
pub fn is_valid_prefix(state: &InstallationState) -> bool {
    let expected = applicable(state);
    state.stages_completed.len() <= expected.len()
        && state
            .stages_completed
            .iter()
            .zip(expected.iter())
            .all(|(done, stage)| *done == stage.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Branch, InstallRequest, SecureBootKeys};

    fn state(target: Target, mode: InstallMode) -> InstallationState {
        InstallationState::new(&InstallRequest::new(target).with_mode(mode))
    }

    #[test]
    fn test_every_registry_starts_with_preflight_and_ends_with_verify() {
        for target in [Target::Driver, Target::Cuda] {
            for mode in [InstallMode::Binary, InstallMode::Repository] {
                let stages = registry(target, mode);
                assert_eq!(stages.first().unwrap().id, StageId::PreFlight);
                assert_eq!(stages.last().unwrap().id, StageId::Verify);
                assert!(stages.iter().any(|s| s.requires_reboot));
            }
        }
    }

    #[test]
    fn test_sign_modules_only_with_secure_boot() {
        let plain = state(Target::Driver, InstallMode::Repository);
        assert!(!applicable(&plain).iter().any(|s| s.id == StageId::SignModules));

        let signed = InstallationState::new(
            &InstallRequest::new(Target::Driver)
                .with_mode(InstallMode::Repository)
                .with_branch(Branch::Production)
                .with_secure_boot(Some(SecureBootKeys {
                    public_key: "/root/public.der".into(),
                    private_key: "/root/private.key".into(),
                })),
        );
        let ids: Vec<_> = applicable(&signed).iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                StageId::PreFlight,
                StageId::ConfigureRepository,
                StageId::InstallPackages,
                StageId::SignModules,
                StageId::Reboot,
                StageId::Verify,
            ]
        );
    }

    #[test]
    fn test_next_stage_and_prefix() {
        let mut s = state(Target::Driver, InstallMode::Binary);
        assert_eq!(next_stage(&s).unwrap().id, StageId::PreFlight);

        s.stages_completed = vec![StageId::PreFlight, StageId::Prerequisites];
        assert!(is_valid_prefix(&s));
        assert_eq!(next_stage(&s).unwrap().id, StageId::DownloadDriver);

        s.stages_completed = vec![StageId::PreFlight, StageId::DownloadDriver];
        assert!(!is_valid_prefix(&s));
    }

    #[test]
    fn test_stage_display_matches_serde() {
        for stage in registry(Target::Cuda, InstallMode::Repository) {
            let json = serde_json::to_string(&stage.id).unwrap();
            assert_eq!(json.trim_matches('"'), stage.id.to_string());
        }
    }
}
