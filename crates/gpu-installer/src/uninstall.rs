//! Driver removal.

use std::path::Path;

use tracing::info;

use crate::capabilities::Capabilities;
use crate::config::{driver_artifact, multiregion_for, Branch, Target, FALLBACK_MULTIREGION};
use crate::error::InstallError;
use crate::state::StateStore;

/// Remove a driver installed from the `.run` installer and release the kernel hold.
///
/// Returns `false` when no driver was found. The driver state file is archived
/// so a later `install_driver` starts from scratch.
///
/// # Errors
///
/// Returns an error if the uninstaller fails or another invocation holds the driver lock.
pub async fn uninstall_driver(
    caps: &Capabilities,
    store: &StateStore,
    branch: Branch,
    work_dir: &Path,
) -> Result<bool, InstallError> {
    if !caps.host.is_privileged() {
        return Err(InstallError::PermissionDenied(
            "the installer must run as root".to_string(),
        ));
    }
    let _lock = store.lock(Target::Driver, &caps.host.boot_id()?)?;

    if !caps.gpu.driver_installed().await? {
        info!("GPU driver not found");
        return Ok(false);
    }

    let region = caps
        .host
        .zone()
        .await
        .map_or(FALLBACK_MULTIREGION, |z| multiregion_for(&z));
    let installer = caps
        .fetcher
        .fetch(&driver_artifact(region, branch), work_dir)
        .await?;

    info!("Starting uninstallation");
    caps.installer.run_driver_uninstaller(&installer).await?;
    caps.installer.unlock_kernel().await?;
    store.archive(Target::Driver)?;
    info!("Uninstallation completed");
    Ok(true)
}
