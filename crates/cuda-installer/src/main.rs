//! NVIDIA driver and CUDA Toolkit installer.
//!
//! Installing a driver takes reboots. Run the same install command after each
//! boot (or let the registered boot service do it) until it exits with 0.
//!
//! Exit codes: 0 done, 1 failed, 2 reboot required, 3 timed out,
//! 4 another installation is running, 5 state started with different options.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use gpu_installer::config::INSTALLER_DIR;
use gpu_installer::Target;

mod commands;
mod exit;
mod logging;
mod ui;

use commands::build::BuildArgs;
use commands::install::{InstallArgs, UninstallArgs};
use commands::state::{ResetArgs, StatusArgs};
use commands::verify::VerifyArgs;

/// Install NVIDIA GPU drivers and the CUDA Toolkit, or bake them into an image.
#[derive(Parser)]
#[command(
    name = "cuda-installer",
    version,
    about = "NVIDIA driver and CUDA Toolkit installer",
    long_about = "Install NVIDIA GPU drivers and the CUDA Toolkit on supported Linux distributions.\n\n\
                  Installation progress is kept in a state file, so re-running the same\n\
                  command after a reboot continues where the previous run stopped."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for state files, downloads and the log.
    #[arg(long, global = true, env = "CUDA_INSTALLER_DIR", default_value = INSTALLER_DIR)]
    installer_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)]
enum Commands {
    /// Install the NVIDIA driver.
    #[command(name = "install_driver")]
    InstallDriver(InstallArgs),

    /// Install the CUDA Toolkit. The driver must be installed first.
    #[command(name = "install_cuda")]
    InstallCuda(InstallArgs),

    /// Check whether the NVIDIA driver is installed.
    #[command(name = "verify_driver")]
    VerifyDriver(VerifyArgs),

    /// Check whether the driver and the CUDA Toolkit are installed.
    #[command(name = "verify_cuda")]
    VerifyCuda(VerifyArgs),

    /// Bake an image with the driver (and toolkit) preinstalled.
    #[command(name = "build_image")]
    BuildImage(BuildArgs),

    /// Remove a driver installed from NVIDIA's installer.
    #[command(name = "uninstall_driver")]
    UninstallDriver(UninstallArgs),

    /// Show installation progress.
    Status(StatusArgs),

    /// Discard a target's installation progress.
    Reset(ResetArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, &cli.installer_dir);
    let dir = cli.installer_dir.as_path();

    let result = match &cli.command {
        Commands::InstallDriver(args) => commands::install::install(Target::Driver, args, dir).await,
        Commands::InstallCuda(args) => commands::install::install(Target::Cuda, args, dir).await,
        Commands::VerifyDriver(args) => commands::verify::run(Target::Driver, args).await,
        Commands::VerifyCuda(args) => commands::verify::run(Target::Cuda, args).await,
        Commands::BuildImage(args) => commands::build::run(args).await,
        Commands::UninstallDriver(args) => commands::install::uninstall(args, dir).await,
        Commands::Status(args) => commands::state::status(args, dir),
        Commands::Reset(args) => commands::state::reset(args, dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            ui::print_error(&format!("{e:#}"));
            ExitCode::from(exit::for_error(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use gpu_installer::{Branch, InstallMode};
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    #[serial]
    fn test_install_flags() {
        let cli = Cli::try_parse_from([
            "cuda-installer",
            "install_driver",
            "--installation-mode",
            "repo",
            "--installation-branch",
            "nfb",
            "--ignore-no-gpu",
            "--no-reboot",
        ])
        .unwrap();

        let Commands::InstallDriver(args) = cli.command else {
            panic!("expected install_driver");
        };
        let request = args.request(Target::Driver);
        assert_eq!(request.mode, InstallMode::Repository);
        assert_eq!(request.branch, Branch::NewFeature);
        assert!(request.ignore_no_gpu);
        assert!(request.secure_boot.is_none());
        assert!(args.no_reboot);
        assert!(!args.no_resume);
    }

    #[test]
    #[serial]
    fn test_secure_boot_keys_must_be_paired() {
        let half = Cli::try_parse_from([
            "cuda-installer",
            "install_driver",
            "--secure-boot-pub-key",
            "/root/mok.der",
        ]);
        assert!(half.is_err());

        let cli = Cli::try_parse_from([
            "cuda-installer",
            "install_cuda",
            "--secure-boot-pub-key",
            "/root/mok.der",
            "--secure-boot-priv-key",
            "/root/mok.key",
        ])
        .unwrap();
        let Commands::InstallCuda(args) = cli.command else {
            panic!("expected install_cuda");
        };
        let keys = args.request(Target::Cuda).secure_boot.unwrap();
        assert_eq!(keys.private_key, PathBuf::from("/root/mok.key"));
    }

    #[test]
    #[serial]
    fn test_verify_cuda_flags() {
        let cli = Cli::try_parse_from([
            "cuda-installer",
            "verify_cuda",
            "--installation-branch",
            "lts",
            "--skip-samples",
            "--json",
        ])
        .unwrap();
        let Commands::VerifyCuda(args) = cli.command else {
            panic!("expected verify_cuda");
        };
        assert_eq!(args.installation_branch, Branch::LongTermSupport);
        assert!(args.skip_samples);
        assert!(args.json);
    }

    #[test]
    #[serial]
    fn test_unknown_branch_rejected() {
        assert!(Cli::try_parse_from([
            "cuda-installer",
            "install_driver",
            "--installation-branch",
            "beta"
        ])
        .is_err());
    }

    #[test]
    #[serial]
    fn test_installer_dir_from_environment() {
        std::env::set_var("CUDA_INSTALLER_DIR", "/tmp/cuda-test");
        let cli = Cli::try_parse_from(["cuda-installer", "status"]).unwrap();
        std::env::remove_var("CUDA_INSTALLER_DIR");
        assert_eq!(cli.installer_dir, PathBuf::from("/tmp/cuda-test"));

        let cli = Cli::try_parse_from(["cuda-installer", "status"]).unwrap();
        assert_eq!(cli.installer_dir, PathBuf::from(INSTALLER_DIR));
    }
}
