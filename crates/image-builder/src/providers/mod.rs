//! Cloud providers used by the image builder.

pub mod gcloud;
pub mod traits;

pub use gcloud::Gcloud;
pub use traits::{
    ComputeProvider, ImageProvider, ImageRef, ImageRequest, InstanceSpec, InstanceStatus,
};
