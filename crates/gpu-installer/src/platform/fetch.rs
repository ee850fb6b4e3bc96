//! Checksum-verified downloads from the regional mirrors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::capabilities::ArtifactFetcher;
use crate::config::Artifact;
use crate::error::InstallError;

/// HTTP downloader backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("cuda-installer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

/// SHA-256 of a file on disk, hex encoded.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn sha256_file(path: &Path) -> Result<String, InstallError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, artifact: &Artifact, dest_dir: &Path) -> Result<PathBuf, InstallError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(artifact.file_name());

        if dest.exists() {
            if sha256_file(&dest).await? == artifact.sha256 {
                debug!(file = %dest.display(), "Reusing verified download");
                return Ok(dest);
            }
            info!(file = %dest.display(), "Existing file does not match checksum, downloading again");
            tokio::fs::remove_file(&dest).await?;
        }

        info!(url = %artifact.url, "Downloading");
        let response = self.client.get(&artifact.url).send().await?;
        let response = match response.error_for_status() {
            Ok(r) => r,
            Err(e) if e.status().is_some_and(|s| s.is_server_error()) => {
                return Err(InstallError::Transient(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if actual != artifact.sha256 {
            tokio::fs::remove_file(&partial).await?;
            return Err(InstallError::ChecksumMismatch {
                file: artifact.file_name().to_string(),
                expected: artifact.sha256.clone(),
                actual,
            });
        }

        tokio::fs::rename(&partial, &dest).await?;
        info!(file = %dest.display(), "Download verified");
        Ok(dest)
    }
}
