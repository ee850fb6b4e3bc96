//! Resumable NVIDIA driver and CUDA Toolkit installation.
//!
//! Installing a GPU driver usually takes one or more reboots. This crate keeps
//! the installation's progress in a state file so the same command can be
//! re-run after every boot until it reports completion.
//!
//! # Example
//!
//! ```rust,ignore
//! use gpu_installer::config::{InstallRequest, Target, INSTALLER_DIR};
//! use gpu_installer::machine::{InstallationDriver, Outcome};
//! use gpu_installer::state::StateStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let caps = gpu_installer::platform::detect(INSTALLER_DIR.as_ref())?;
//!     let driver = InstallationDriver::new(
//!         caps,
//!         StateStore::new(INSTALLER_DIR),
//!         InstallRequest::new(Target::Driver),
//!     );
//!
//!     match driver.run().await? {
//!         Outcome::Complete => println!("driver installed"),
//!         Outcome::RebootRequired { .. } => println!("reboot and run again"),
//!         Outcome::Continue => unreachable!(),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod error;
pub mod machine;
pub mod platform;
pub mod stages;
pub mod state;
pub mod uninstall;
pub mod verify;

pub use capabilities::Capabilities;
pub use config::{Branch, InstallMode, InstallRequest, SecureBootKeys, Target};
pub use error::{ErrorKind, InstallError};
pub use machine::{InstallationDriver, Outcome};
pub use stages::StageId;
pub use state::{InstallationState, RetryConfig, StateStore};
