//! Checksum-verified downloads against a mock mirror.

use gpu_installer::capabilities::ArtifactFetcher;
use gpu_installer::config::Artifact;
use gpu_installer::platform::fetch::sha256_file;
use gpu_installer::platform::HttpFetcher;
use gpu_installer::{ErrorKind, InstallError};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &[u8] = b"#!/bin/sh\necho installing driver\n";

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

async fn mirror(status: u16, expected_calls: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drivers/NVIDIA-Linux-x86_64-580.82.07.run"))
        .respond_with(ResponseTemplate::new(status).set_body_bytes(BODY))
        .expect(expected_calls)
        .mount(&server)
        .await;
    server
}

fn artifact(server: &MockServer, sha256: String) -> Artifact {
    Artifact {
        url: format!("{}/drivers/NVIDIA-Linux-x86_64-580.82.07.run", server.uri()),
        sha256,
    }
}

#[tokio::test]
async fn test_download_and_reuse() {
    let server = mirror(200, 1).await;
    let dir = TempDir::new().unwrap();
    let fetcher = HttpFetcher::new().unwrap();
    let artifact = artifact(&server, checksum(BODY));

    let first = fetcher.fetch(&artifact, dir.path()).await.unwrap();
    assert_eq!(std::fs::read(&first).unwrap(), BODY);
    assert_eq!(sha256_file(&first).await.unwrap(), artifact.sha256);

    // Second fetch is served from disk; the mock expects a single request.
    let second = fetcher.fetch(&artifact, dir.path()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_nothing_behind() {
    let server = mirror(200, 1).await;
    let dir = TempDir::new().unwrap();
    let fetcher = HttpFetcher::new().unwrap();
    let artifact = artifact(&server, "00".repeat(32));

    let err = fetcher.fetch(&artifact, dir.path()).await.unwrap_err();
    assert!(matches!(err, InstallError::ChecksumMismatch { .. }));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_corrupted_cached_file_is_replaced() {
    let server = mirror(200, 1).await;
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("NVIDIA-Linux-x86_64-580.82.07.run"), b"truncated").unwrap();

    let fetcher = HttpFetcher::new().unwrap();
    let path = fetcher
        .fetch(&artifact(&server, checksum(BODY)), dir.path())
        .await
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap(), BODY);
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = mirror(503, 1).await;
    let dir = TempDir::new().unwrap();
    let err = HttpFetcher::new()
        .unwrap()
        .fetch(&artifact(&server, checksum(BODY)), dir.path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn test_missing_file_is_not_transient() {
    let server = mirror(404, 1).await;
    let dir = TempDir::new().unwrap();
    let err = HttpFetcher::new()
        .unwrap()
        .fetch(&artifact(&server, checksum(BODY)), dir.path())
        .await
        .unwrap_err();
    assert!(!err.is_transient());
}
