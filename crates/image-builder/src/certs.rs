//! Microsoft UEFI CA certificates for image signature databases.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CloudError;

/// Certificates every signature database carries besides the signing key.
pub const MICROSOFT_CERTIFICATES: [&str; 2] = [
    "MicCorUEFCA2011_2011-06-27.crt",
    "MicWinProPCA2011_2011-10-19.crt",
];

/// Provides the default Secure Boot certificates.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Download the certificates into `dest`, returning their paths.
    async fn fetch(&self, dest: &Path) -> Result<Vec<PathBuf>, CloudError>;
}

/// Downloads certificates from a regional mirror.
pub struct MirrorCertificates {
    client: reqwest::Client,
    base_url: String,
}

impl MirrorCertificates {
    /// `mirror` is the mirror root, e.g. `gpu_installer::config::mirror_base("us")`.
    #[must_use]
    pub fn new(mirror: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{}/certificates", mirror.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl CertificateSource for MirrorCertificates {
    async fn fetch(&self, dest: &Path) -> Result<Vec<PathBuf>, CloudError> {
        let mut paths = Vec::with_capacity(MICROSOFT_CERTIFICATES.len());
        for name in MICROSOFT_CERTIFICATES {
            let url = format!("{}/{name}", self.base_url);
            debug!(url = %url, "Downloading certificate");
            let bytes = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            let path = dest.join(name);
            tokio::fs::write(&path, &bytes).await?;
            paths.push(path);
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_fetch_both_certificates() {
        let server = MockServer::start().await;
        for name in MICROSOFT_CERTIFICATES {
            Mock::given(method("GET"))
                .and(path(format!("/certificates/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(name.as_bytes()))
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = tempfile::TempDir::new().unwrap();
        let paths = MirrorCertificates::new(&server.uri())
            .fetch(dir.path())
            .await
            .unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(
            std::fs::read_to_string(&paths[0]).unwrap(),
            "MicCorUEFCA2011_2011-06-27.crt"
        );
    }

    #[tokio::test]
    async fn test_missing_certificate_is_an_error() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let err = MirrorCertificates::new(&server.uri())
            .fetch(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Http(_)));
    }
}
