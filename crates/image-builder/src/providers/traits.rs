//! Cloud capability traits and their request/response types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudError;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Suspending,
    Suspended,
    Terminated,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "PROVISIONING",
            Self::Staging => "STAGING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Suspending => "SUSPENDING",
            Self::Suspended => "SUSPENDED",
            Self::Terminated => "TERMINATED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Request to create a build instance with its boot disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub image_family: String,
    pub image_project: String,
    pub disk_name: String,
    pub disk_size_gb: u32,
    pub disk_type: String,
    pub network: String,
    pub subnet: String,
    /// Hard limit after which the provider deletes the instance on its own.
    pub max_run_duration: String,
    /// Instance metadata entries (key to content).
    pub metadata: BTreeMap<String, String>,
}

/// Request to capture a disk as an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub name: String,
    pub source_disk: String,
    pub source_disk_zone: String,
    pub storage_location: String,
    pub family: Option<String>,
    /// Certificates for the image's Secure Boot signature database.
    pub signature_db: Vec<PathBuf>,
}

/// A created image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub project: String,
    pub name: String,
    pub family: Option<String>,
    pub storage_location: String,
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/global/images/{}", self.project, self.name)
    }
}

/// Instance and disk lifecycle.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create an instance; returns its id.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, CloudError>;

    /// Current instance status.
    async fn instance_status(&self, id: &str) -> Result<InstanceStatus, CloudError>;

    /// Serial port 1 output so far.
    async fn serial_output(&self, id: &str) -> Result<String, CloudError>;

    /// Stop a running instance.
    async fn stop_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Delete an instance; deleting a missing instance succeeds.
    async fn delete_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Delete a disk; deleting a missing disk succeeds.
    async fn delete_disk(&self, id: &str) -> Result<(), CloudError>;

    /// Command an operator can use to log into the instance.
    fn ssh_command(&self, id: &str) -> String;
}

/// Image lifecycle.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Capture a disk as an image.
    async fn capture_from_disk(&self, request: &ImageRequest) -> Result<ImageRef, CloudError>;
}
