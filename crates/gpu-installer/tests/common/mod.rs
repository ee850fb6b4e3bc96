//! In-memory capability providers for driving the state machine in tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gpu_installer::capabilities::{
    ArtifactFetcher, Capabilities, GpuDetector, GpuPresence, HostInfo, ModuleSigner,
    PrivilegedInstaller, Rebooter, SampleRunner,
};
use gpu_installer::config::{
    Artifact, DriverRelease, InstallRequest, SecureBootKeys, Target, ToolkitRelease,
};
use gpu_installer::{InstallError, InstallationDriver, Outcome, RetryConfig, StateStore};
use tempfile::TempDir;

/// Ordered record of every side effect.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<InstallError>>>,
}

impl Journal {
    pub fn record(&self, op: impl Into<String>) {
        self.entries.lock().unwrap().push(op.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == op).count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: &str, error: InstallError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    fn take_failure(&self, op: &str) -> Result<(), InstallError> {
        let next = self
            .failures
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front);
        match next {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fail if a failure is queued for `op`, otherwise record it.
    fn call(&self, op: &str, detail: impl Into<String>) -> Result<(), InstallError> {
        self.take_failure(op)?;
        self.record(detail);
        Ok(())
    }
}

pub struct FakeHost {
    boot: AtomicU32,
    pub privileged: AtomicBool,
    pub zone: Mutex<Option<String>>,
}

impl FakeHost {
    /// Simulate a reboot.
    pub fn reboot(&self) {
        self.boot.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostInfo for FakeHost {
    fn boot_id(&self) -> Result<String, InstallError> {
        Ok(format!("boot-{}", self.boot.load(Ordering::SeqCst)))
    }

    fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::SeqCst)
    }

    async fn zone(&self) -> Option<String> {
        self.zone.lock().unwrap().clone()
    }
}

pub struct FakeGpu {
    pub present: AtomicBool,
    pub driver: AtomicBool,
    pub toolkit: AtomicBool,
}

#[async_trait]
impl GpuDetector for FakeGpu {
    async fn detect_gpu(&self) -> Result<GpuPresence, InstallError> {
        if self.present.load(Ordering::SeqCst) {
            Ok(GpuPresence::device("10de:2330"))
        } else {
            Ok(GpuPresence::absent())
        }
    }

    async fn driver_installed(&self) -> Result<bool, InstallError> {
        Ok(self.driver.load(Ordering::SeqCst))
    }

    async fn toolkit_installed(&self, _toolkit: &ToolkitRelease) -> Result<bool, InstallError> {
        Ok(self.toolkit.load(Ordering::SeqCst))
    }
}

pub struct FakeInstaller {
    journal: Arc<Journal>,
    gpu: Arc<FakeGpu>,
}

#[async_trait]
impl PrivilegedInstaller for FakeInstaller {
    fn platform(&self) -> String {
        "Fake Linux 1.0".to_string()
    }

    async fn install_prerequisites(&self) -> Result<(), InstallError> {
        self.journal.call("install_prerequisites", "install_prerequisites")
    }

    async fn configure_repository(&self, multiregion: &str) -> Result<(), InstallError> {
        self.journal
            .call("configure_repository", format!("configure_repository:{multiregion}"))
    }

    async fn install_driver_packages(&self, driver: &DriverRelease) -> Result<(), InstallError> {
        self.journal.call(
            "install_driver_packages",
            format!("install_driver_packages:{}", driver.major()),
        )?;
        self.gpu.driver.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn install_toolkit_packages(
        &self,
        toolkit: &ToolkitRelease,
    ) -> Result<(), InstallError> {
        self.journal.call(
            "install_toolkit_packages",
            format!("install_toolkit_packages:{}", toolkit.package()),
        )?;
        self.gpu.toolkit.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_driver_installer(
        &self,
        installer: &Path,
        keys: Option<&SecureBootKeys>,
    ) -> Result<(), InstallError> {
        assert!(installer.exists(), "installer was not downloaded");
        let detail = if keys.is_some() {
            "run_driver_installer:signed"
        } else {
            "run_driver_installer"
        };
        self.journal.call("run_driver_installer", detail)?;
        self.gpu.driver.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_toolkit_installer(&self, installer: &Path) -> Result<(), InstallError> {
        assert!(installer.exists(), "installer was not downloaded");
        self.journal.call("run_toolkit_installer", "run_toolkit_installer")?;
        self.gpu.toolkit.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_driver_uninstaller(&self, _installer: &Path) -> Result<(), InstallError> {
        self.journal.call("run_driver_uninstaller", "run_driver_uninstaller")?;
        self.gpu.driver.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn lock_kernel(&self) -> Result<(), InstallError> {
        self.journal.call("lock_kernel", "lock_kernel")
    }

    async fn unlock_kernel(&self) -> Result<(), InstallError> {
        self.journal.call("unlock_kernel", "unlock_kernel")
    }

    async fn configure_toolkit_environment(
        &self,
        _toolkit: &ToolkitRelease,
    ) -> Result<(), InstallError> {
        self.journal
            .call("configure_toolkit_environment", "configure_toolkit_environment")
    }
}

pub struct FakeFetcher {
    journal: Arc<Journal>,
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn fetch(&self, artifact: &Artifact, dest_dir: &Path) -> Result<PathBuf, InstallError> {
        self.journal.call("fetch", format!("fetch:{}", artifact.url))?;
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(artifact.file_name());
        std::fs::write(&dest, b"#!/bin/sh\n")?;
        Ok(dest)
    }
}

/// Sample runner that pretends to compile; `failing` names a sample that reports FAIL.
pub struct FakeSamples {
    journal: Arc<Journal>,
    pub failing: Mutex<Option<String>>,
}

#[async_trait]
impl SampleRunner for FakeSamples {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<PathBuf, InstallError> {
        assert!(archive.exists(), "samples were not downloaded");
        self.journal.call("unpack", "unpack")?;
        let root = dest.join("cuda-samples");
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    async fn build_and_run(
        &self,
        sample_dir: &Path,
        _toolkit: &ToolkitRelease,
    ) -> Result<String, InstallError> {
        let name = sample_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        self.journal.call("build_and_run", format!("build_and_run:{name}"))?;
        if self.failing.lock().unwrap().as_deref() == Some(name.as_str()) {
            Ok(format!("{name}, CUDA Driver = CUDART\nResult = FAIL\n"))
        } else {
            Ok(format!("{name}, CUDA Driver = CUDART\nResult = PASS\n"))
        }
    }
}

pub struct FakeSigner {
    journal: Arc<Journal>,
}

#[async_trait]
impl ModuleSigner for FakeSigner {
    async fn sign_modules(&self, _keys: &SecureBootKeys) -> Result<usize, InstallError> {
        self.journal.call("sign_modules", "sign_modules")?;
        Ok(3)
    }
}

pub struct FakeRebooter {
    journal: Arc<Journal>,
}

#[async_trait]
impl Rebooter for FakeRebooter {
    async fn register_resume(
        &self,
        target: Target,
        _command: &[String],
    ) -> Result<(), InstallError> {
        self.journal
            .call("register_resume", format!("register_resume:{target}"))
    }

    async fn clear_resume(&self, target: Target) -> Result<(), InstallError> {
        self.journal.call("clear_resume", format!("clear_resume:{target}"))
    }

    async fn reboot(&self) -> Result<(), InstallError> {
        self.journal.call("reboot", "reboot")
    }
}

/// A fake host with a GPU, a temp state directory and a journal.
pub struct Harness {
    pub dir: TempDir,
    pub journal: Arc<Journal>,
    pub host: Arc<FakeHost>,
    pub gpu: Arc<FakeGpu>,
    pub samples: Arc<FakeSamples>,
    pub caps: Capabilities,
}

impl Harness {
    pub fn new() -> Self {
        let journal = Arc::new(Journal::default());
        let host = Arc::new(FakeHost {
            boot: AtomicU32::new(1),
            privileged: AtomicBool::new(true),
            zone: Mutex::new(Some("europe-west4-a".to_string())),
        });
        let gpu = Arc::new(FakeGpu {
            present: AtomicBool::new(true),
            driver: AtomicBool::new(false),
            toolkit: AtomicBool::new(false),
        });
        let caps = Capabilities {
            gpu: gpu.clone(),
            installer: Arc::new(FakeInstaller {
                journal: journal.clone(),
                gpu: gpu.clone(),
            }),
            fetcher: Arc::new(FakeFetcher {
                journal: journal.clone(),
            }),
            signer: Arc::new(FakeSigner {
                journal: journal.clone(),
            }),
            rebooter: Arc::new(FakeRebooter {
                journal: journal.clone(),
            }),
            host: host.clone(),
        };
        let samples = Arc::new(FakeSamples {
            journal: journal.clone(),
            failing: Mutex::new(None),
        });
        Self {
            dir: TempDir::new().unwrap(),
            journal,
            host,
            gpu,
            samples,
            caps,
        }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.dir.path().join("state"))
    }

    pub fn downloads(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn driver(&self, request: InstallRequest) -> InstallationDriver {
        InstallationDriver::new(self.caps.clone(), self.store(), request)
            .with_retry(RetryConfig::immediate(3))
            .with_work_dir(self.downloads())
            .with_resume_command(vec!["cuda-installer".into(), "install_driver".into()])
    }

    /// Invoke once per boot until complete, rebooting in between.
    pub async fn run_to_completion(&self, request: InstallRequest) -> Vec<Outcome> {
        let driver = self.driver(request);
        let mut outcomes = Vec::new();
        for _ in 0..10 {
            let outcome = driver.run().await.unwrap();
            outcomes.push(outcome);
            match outcome {
                Outcome::Complete => return outcomes,
                Outcome::RebootRequired { .. } => self.host.reboot(),
                Outcome::Continue => unreachable!("run never stops on Continue"),
            }
        }
        panic!("installation did not complete: {outcomes:?}");
    }
}
