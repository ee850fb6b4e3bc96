//! Secure Boot signing key pairs for image builds.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gpu_installer::platform::command::{CommandRunner, Invocation};
use gpu_installer::SecureBootKeys;
use tracing::{info, warn};

use crate::error::CloudError;

/// Subject of generated signing certificates.
pub const KEY_SUBJECT: &str = "/CN=Graphics Drivers Secure Boot Signing";

/// Creates and destroys signing key pairs.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Generate a pair into `dir` (`mok.key`, `mok.der`).
    async fn generate(&self, dir: &Path) -> Result<SecureBootKeys, CloudError>;

    /// Securely remove a pair from disk.
    async fn destroy(&self, keys: &SecureBootKeys) -> Result<(), CloudError>;
}

/// `openssl` key generation and `shred` removal.
pub struct OpenSslKeys {
    runner: Arc<dyn CommandRunner>,
}

impl OpenSslKeys {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// Key and certificate paths inside `dir`.
#[must_use]
pub fn key_paths(dir: &Path) -> SecureBootKeys {
    SecureBootKeys {
        public_key: dir.join("mok.der"),
        private_key: dir.join("mok.key"),
    }
}

fn command_error(inv: &Invocation, err: impl std::fmt::Display) -> CloudError {
    CloudError::Command {
        command: inv.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl KeyGenerator for OpenSslKeys {
    async fn generate(&self, dir: &Path) -> Result<SecureBootKeys, CloudError> {
        tokio::fs::create_dir_all(dir).await?;
        let keys = key_paths(dir);

        let inv = Invocation::new("openssl")
            .args(["req", "-new", "-x509", "-newkey", "rsa:2048"])
            .arg("-keyout")
            .arg(keys.private_key.display().to_string())
            .arg("-out")
            .arg(keys.public_key.display().to_string())
            .args(["-days", "36500", "-outform", "der", "-noenc", "-subj", KEY_SUBJECT]);
        self.runner
            .run(&inv)
            .await
            .map_err(|e| command_error(&inv, e))?;

        info!(dir = %dir.display(), "Generated Secure Boot signing keys");
        Ok(keys)
    }

    async fn destroy(&self, keys: &SecureBootKeys) -> Result<(), CloudError> {
        for path in [&keys.private_key, &keys.public_key] {
            if !path.exists() {
                continue;
            }
            let inv = Invocation::new("shred")
                .arg("-uz")
                .arg(path.display().to_string());
            if let Err(e) = self.runner.run(&inv).await {
                warn!(path = %path.display(), error = %e, "shred failed, removing");
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gpu_installer::platform::command::CommandOutput;
    use gpu_installer::InstallError;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, InstallError> {
            self.0.lock().unwrap().push(invocation.to_string());
            Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            })
        }
    }

    #[tokio::test]
    async fn test_generate_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let keys = OpenSslKeys::new(recorder.clone())
            .generate(dir.path())
            .await
            .unwrap();

        assert_eq!(keys.public_key, dir.path().join("mok.der"));
        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("openssl req -new -x509 -newkey rsa:2048"));
        assert!(calls[0].contains("-outform der -noenc -subj /CN=Graphics Drivers Secure Boot Signing"));
    }

    #[tokio::test]
    async fn test_destroy_skips_missing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let keys = key_paths(dir.path());
        std::fs::write(&keys.private_key, "secret").unwrap();

        let recorder = Arc::new(Recorder::default());
        OpenSslKeys::new(recorder.clone()).destroy(&keys).await.unwrap();

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("shred -uz"));
        assert!(calls[0].ends_with("mok.key"));
    }
}
