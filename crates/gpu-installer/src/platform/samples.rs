//! Building CUDA samples from source.
//!
//! Older `cuda-samples` releases ship a Makefile per sample; newer ones only
//! CMake projects. Both are handled, the binary ends up next to the build files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capabilities::SampleRunner;
use crate::config::ToolkitRelease;
use crate::error::InstallError;
use crate::platform::command::{CommandRunner, Invocation};

/// Sample runner using `tar`, `make` or `cmake` on the host.
pub struct SystemSampleRunner {
    runner: Arc<dyn CommandRunner>,
}

impl SystemSampleRunner {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

fn sample_name(sample_dir: &Path) -> Result<String, InstallError> {
    sample_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            InstallError::InvalidArgument(format!(
                "not a sample directory: {}",
                sample_dir.display()
            ))
        })
}

/// Compiler environment for a sample build.
fn toolkit_env(invocation: Invocation, toolkit: &ToolkitRelease) -> Invocation {
    let path = std::env::var("PATH").unwrap_or_default();
    invocation
        .env("CUDA_PATH", toolkit.prefix().display().to_string())
        .env("PATH", format!("{}:{path}", toolkit.bin_dir().display()))
}

/// First directory directly below `dest`.
fn unpacked_root(dest: &Path, archive: &Path) -> Result<PathBuf, InstallError> {
    for entry in std::fs::read_dir(dest)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            return Ok(entry.path());
        }
    }
    Err(InstallError::InvalidArgument(format!(
        "{} contains no source directory",
        archive.display()
    )))
}

#[async_trait]
impl SampleRunner for SystemSampleRunner {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<PathBuf, InstallError> {
        self.runner
            .run(
                &Invocation::new("tar")
                    .arg("-xzf")
                    .arg(archive.display().to_string())
                    .arg("-C")
                    .arg(dest.display().to_string()),
            )
            .await?;
        unpacked_root(dest, archive)
    }

    async fn build_and_run(
        &self,
        sample_dir: &Path,
        toolkit: &ToolkitRelease,
    ) -> Result<String, InstallError> {
        let name = sample_name(sample_dir)?;
        let dir = sample_dir.display().to_string();

        let binary = if sample_dir.join("Makefile").is_file() {
            self.runner
                .run(&toolkit_env(Invocation::new("make").args(["-C", dir.as_str()]), toolkit))
                .await?;
            sample_dir.join(&name)
        } else {
            let build_dir = sample_dir.join("build");
            let build = build_dir.display().to_string();
            let nvcc = toolkit.bin_dir().join("nvcc");
            self.runner
                .run(&toolkit_env(
                    Invocation::new("cmake")
                        .args(["-S", dir.as_str(), "-B", build.as_str()])
                        .arg(format!("-DCMAKE_CUDA_COMPILER={}", nvcc.display())),
                    toolkit,
                ))
                .await?;
            self.runner
                .run(&toolkit_env(
                    Invocation::new("cmake").args(["--build", build.as_str()]),
                    toolkit,
                ))
                .await?;
            build_dir.join(&name)
        };

        info!(sample = %name, "Running CUDA sample");
        let out = self
            .runner
            .run(&Invocation::new(binary.display().to_string()))
            .await?;
        debug!(sample = %name, output = %out.stdout, "Sample output");
        Ok(out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::platform::command::CommandOutput;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, InstallError> {
            self.calls.lock().unwrap().push(invocation.to_string());
            Ok(CommandOutput {
                code: Some(0),
                stdout: "Result = PASS\n".into(),
                stderr: String::new(),
            })
        }
    }

    fn toolkit() -> ToolkitRelease {
        crate::config::release_for(crate::config::Branch::Production).toolkit
    }

    #[tokio::test]
    async fn test_makefile_sample() {
        let dir = tempfile::TempDir::new().unwrap();
        let sample = dir.path().join("deviceQuery");
        std::fs::create_dir(&sample).unwrap();
        std::fs::write(sample.join("Makefile"), "all:\n").unwrap();
        let recorder = Arc::new(Recorder::default());

        let out = SystemSampleRunner::new(recorder.clone())
            .build_and_run(&sample, &toolkit())
            .await
            .unwrap();

        assert!(out.contains("Result = PASS"));
        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls[0], format!("make -C {}", sample.display()));
        assert_eq!(calls[1], sample.join("deviceQuery").display().to_string());
    }

    #[tokio::test]
    async fn test_cmake_sample_builds_out_of_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let sample = dir.path().join("bandwidthTest");
        std::fs::create_dir(&sample).unwrap();
        let recorder = Arc::new(Recorder::default());

        SystemSampleRunner::new(recorder.clone())
            .build_and_run(&sample, &toolkit())
            .await
            .unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("cmake -S"));
        assert!(calls[0].ends_with("-DCMAKE_CUDA_COMPILER=/usr/local/cuda-13.0/bin/nvcc"));
        assert!(calls[1].starts_with("cmake --build"));
        assert_eq!(calls[2], sample.join("build/bandwidthTest").display().to_string());
    }

    #[test]
    fn test_unpacked_root() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("v13.0.tar.gz"), b"").unwrap();
        assert!(unpacked_root(dir.path(), Path::new("v13.0.tar.gz")).is_err());

        std::fs::create_dir(dir.path().join("cuda-samples-13.0")).unwrap();
        assert_eq!(
            unpacked_root(dir.path(), Path::new("v13.0.tar.gz")).unwrap(),
            dir.path().join("cuda-samples-13.0")
        );
    }
}
