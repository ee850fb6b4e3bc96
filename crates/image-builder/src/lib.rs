//! GPU-ready disk image builds.
//!
//! Provisions a disposable build instance from a base OS image, lets its
//! startup script install the NVIDIA driver (and optionally the CUDA Toolkit)
//! with modules signed for Secure Boot, and captures the boot disk as an image
//! whose signature database trusts the signing key.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use gpu_installer::config::mirror_base;
//! use gpu_installer::platform::command::SystemRunner;
//! use image_builder::{BaseImage, BuildConfig, Gcloud, ImageBuilder, MirrorCertificates, OpenSslKeys};
//!
//! let config = BuildConfig::new("my-project", "us-central1-a", BaseImage::Ubuntu22, "gpu-image");
//! let runner = Arc::new(SystemRunner);
//! let gcloud = Arc::new(Gcloud::new(&config.project, &config.zone, runner.clone()));
//! let builder = ImageBuilder::new(
//!     gcloud.clone(),
//!     gcloud,
//!     Arc::new(OpenSslKeys::new(runner)),
//!     Arc::new(MirrorCertificates::new(&mirror_base(config.mirror_region()))),
//! );
//! let image = builder.build(&config).await?;
//! println!("{image}");
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod bootstrap;
pub mod certs;
pub mod config;
pub mod error;
pub mod keys;
pub mod orchestrator;
pub mod providers;

pub use certs::{CertificateSource, MirrorCertificates};
pub use config::{BaseImage, BuildConfig, DiskType, KeySource, PollConfig};
pub use error::{BuildError, BuildErrorKind, CloudError, Resource};
pub use keys::{KeyGenerator, OpenSslKeys};
pub use orchestrator::{BuildJob, BuildStatus, ImageBuilder, Interaction, Unattended};
pub use providers::{ComputeProvider, Gcloud, ImageProvider, ImageRef};
