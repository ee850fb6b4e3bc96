//! Boot identity, privilege and zone lookup for the local host.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::capabilities::HostInfo;
use crate::error::InstallError;

const BOOT_ID_FILE: &str = "/proc/sys/kernel/random/boot_id";
const ZONE_METADATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/zone";

/// Zone name from a metadata value such as `projects/123/zones/us-central1-a`.
#[must_use]
pub fn zone_from_metadata(value: &str) -> Option<String> {
    let zone = value.trim().rsplit('/').next()?.trim();
    (!zone.is_empty()).then(|| zone.to_string())
}

/// The host this process runs on.
#[derive(Debug, Clone)]
pub struct LocalHost {
    boot_id_file: PathBuf,
    metadata_url: String,
}

impl Default for LocalHost {
    fn default() -> Self {
        Self {
            boot_id_file: PathBuf::from(BOOT_ID_FILE),
            metadata_url: ZONE_METADATA_URL.to_string(),
        }
    }
}

impl LocalHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Query a different metadata endpoint.
    #[must_use]
    pub fn with_metadata_url(mut self, url: impl Into<String>) -> Self {
        self.metadata_url = url.into();
        self
    }

    async fn fetch_zone(&self) -> Result<String, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?
            .get(&self.metadata_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl HostInfo for LocalHost {
    fn boot_id(&self) -> Result<String, InstallError> {
        let id = std::fs::read_to_string(&self.boot_id_file)?;
        Ok(id.trim().to_string())
    }

    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    async fn zone(&self) -> Option<String> {
        match self.fetch_zone().await {
            Ok(value) => {
                let zone = zone_from_metadata(&value);
                debug!(zone = ?zone, "Resolved instance zone");
                zone
            }
            Err(e) => {
                warn!(error = %e, "Could not read the instance zone from the metadata server");
                None
            }
        }
    }
}
