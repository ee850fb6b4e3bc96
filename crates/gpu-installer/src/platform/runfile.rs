//! Distribution-independent steps shared by the apt and dnf installers:
//! NVIDIA `.run` installers and toolkit post-installation.

use std::path::Path;

use tracing::info;

use crate::config::{SecureBootKeys, ToolkitRelease};
use crate::error::InstallError;
use crate::platform::command::{CommandRunner, Invocation};

/// Installed by the driver; absence means there is no daemon to configure.
const PERSISTENCED_BINARY: &str = "/usr/bin/nvidia-persistenced";

pub(crate) fn driver_install(installer: &Path, keys: Option<&SecureBootKeys>) -> Invocation {
    let mut inv = Invocation::new("sh")
        .arg(installer.display().to_string())
        .arg("-s");
    if let Some(keys) = keys {
        inv = inv
            .arg(format!(
                "--module-signing-secret-key={}",
                keys.private_key.display()
            ))
            .arg(format!(
                "--module-signing-public-key={}",
                keys.public_key.display()
            ));
    }
    inv
}

pub(crate) async fn run_driver_installer(
    runner: &dyn CommandRunner,
    installer: &Path,
    keys: Option<&SecureBootKeys>,
) -> Result<(), InstallError> {
    if let Some(keys) = keys {
        for key in [&keys.public_key, &keys.private_key] {
            if !key.is_file() {
                return Err(InstallError::InvalidArgument(format!(
                    "secure boot key {} does not exist",
                    key.display()
                )));
            }
        }
        info!(public_key = %keys.public_key.display(), "Signing driver modules during installation");
    }
    runner.run(&driver_install(installer, keys)).await?;
    Ok(())
}

pub(crate) async fn run_toolkit_installer(
    runner: &dyn CommandRunner,
    installer: &Path,
) -> Result<(), InstallError> {
    runner
        .run(
            &Invocation::new("sh")
                .arg(installer.display().to_string())
                .args(["--silent", "--toolkit"]),
        )
        .await?;
    Ok(())
}

pub(crate) async fn run_driver_uninstaller(
    runner: &dyn CommandRunner,
    installer: &Path,
) -> Result<(), InstallError> {
    runner
        .run(
            &Invocation::new("sh")
                .arg(installer.display().to_string())
                .args(["-s", "--uninstall"]),
        )
        .await?;
    Ok(())
}

/// Content of the login profile that puts the toolkit on every user's path.
pub(crate) fn cuda_profile(toolkit: &ToolkitRelease) -> String {
    format!(
        "# Configuring CUDA toolkit. File created by the CUDA installer.\n\
         export PATH={bin}${{PATH:+:${{PATH}}}}\n\
         export LD_LIBRARY_PATH={lib}${{LD_LIBRARY_PATH:+:${{LD_LIBRARY_PATH}}}}\n",
        bin = toolkit.bin_dir().display(),
        lib = toolkit.lib_dir().display(),
    )
}

/// Write the profile script and install the persistence daemon service.
pub(crate) async fn configure_toolkit_environment(
    runner: &dyn CommandRunner,
    toolkit: &ToolkitRelease,
    profile: &Path,
    work_dir: &Path,
    persistenced_archive: &Path,
) -> Result<(), InstallError> {
    tokio::fs::write(profile, cuda_profile(toolkit)).await?;
    info!(profile = %profile.display(), "Wrote CUDA environment profile");

    if !Path::new(PERSISTENCED_BINARY).exists() || !persistenced_archive.exists() {
        info!("nvidia-persistenced not available, skipping service setup");
        return Ok(());
    }

    let scratch = work_dir.join("persistenced");
    tokio::fs::create_dir_all(&scratch).await?;
    runner
        .run(
            &Invocation::new("tar")
                .arg("-xf")
                .arg(persistenced_archive.display().to_string())
                .arg("-C")
                .arg(scratch.display().to_string()),
        )
        .await?;
    info!("Executing nvidia-persistenced installer");
    runner
        .run(
            &Invocation::new("sh").arg(
                scratch
                    .join("nvidia-persistenced-init/install.sh")
                    .display()
                    .to_string(),
            ),
        )
        .await?;
    tokio::fs::remove_dir_all(&scratch).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{release_for, Branch};

    #[test]
    fn test_driver_install_flags() {
        let plain = driver_install(Path::new("/opt/driver.run"), None);
        assert_eq!(plain.to_string(), "sh /opt/driver.run -s");

        let keys = SecureBootKeys {
            public_key: "/keys/mok.der".into(),
            private_key: "/keys/mok.key".into(),
        };
        let signed = driver_install(Path::new("/opt/driver.run"), Some(&keys));
        assert_eq!(
            signed.to_string(),
            "sh /opt/driver.run -s --module-signing-secret-key=/keys/mok.key \
             --module-signing-public-key=/keys/mok.der"
        );
    }

    #[test]
    fn test_cuda_profile() {
        let profile = cuda_profile(&release_for(Branch::Production).toolkit);
        assert!(profile.contains("export PATH=/usr/local/cuda-13.0/bin${PATH:+:${PATH}}"));
        assert!(profile.contains("LD_LIBRARY_PATH=/usr/local/cuda-13.0/lib64$"));
    }
}
