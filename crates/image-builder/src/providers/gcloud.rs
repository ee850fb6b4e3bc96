//! Compute Engine through the `gcloud` CLI.

use std::sync::Arc;

use async_trait::async_trait;
use gpu_installer::platform::command::{CommandRunner, Invocation};
use gpu_installer::InstallError;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::CloudError;
use crate::providers::traits::{
    ComputeProvider, ImageProvider, ImageRef, ImageRequest, InstanceSpec, InstanceStatus,
};

/// `gcloud`-backed compute and image provider for one project and zone.
pub struct Gcloud {
    project: String,
    zone: String,
    runner: Arc<dyn CommandRunner>,
}

#[derive(Deserialize)]
struct DescribedInstance {
    status: InstanceStatus,
}

fn classify(command: &Invocation, err: InstallError) -> CloudError {
    match err {
        InstallError::Command { stderr, .. } => {
            if stderr.contains("QUOTA_EXCEEDED") || stderr.contains("Quota '") {
                CloudError::QuotaExceeded(stderr)
            } else if stderr.contains("was not found") || stderr.contains("notFound") {
                CloudError::NotFound(stderr)
            } else {
                CloudError::Command {
                    command: command.to_string(),
                    message: stderr,
                }
            }
        }
        InstallError::Io(e) => CloudError::Io(e),
        other => CloudError::Command {
            command: command.to_string(),
            message: other.to_string(),
        },
    }
}

impl Gcloud {
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            runner,
        }
    }

    fn compute(&self, args: &[&str]) -> Invocation {
        Invocation::new("gcloud")
            .arg("compute")
            .args(args.iter().copied())
            .arg("--project")
            .arg(&self.project)
            .arg("--zone")
            .arg(&self.zone)
    }

    async fn run(&self, invocation: Invocation) -> Result<String, CloudError> {
        debug!(command = %invocation, "gcloud");
        self.runner
            .run(&invocation)
            .await
            .map(|out| out.stdout)
            .map_err(|e| classify(&invocation, e))
    }

    /// `instances create` invocation; metadata values are read from `metadata_files`.
    #[must_use]
    pub fn create_invocation(&self, spec: &InstanceSpec, metadata_files: &[(String, String)]) -> Invocation {
        let disk = format!(
            "auto-delete=yes,boot=yes,name={},image-family={},image-project={},mode=rw,size={},type={}",
            spec.disk_name, spec.image_family, spec.image_project, spec.disk_size_gb, spec.disk_type
        );
        let mut inv = self
            .compute(&["instances", "create", &spec.name])
            .args(["--machine-type", spec.machine_type.as_str()])
            .args(["--max-run-duration", spec.max_run_duration.as_str()])
            .args(["--instance-termination-action", "DELETE"])
            .args(["--create-disk", disk.as_str()])
            .arg("--no-shielded-secure-boot")
            .args(["--network", spec.network.as_str()])
            .args(["--subnet", spec.subnet.as_str()]);
        if !metadata_files.is_empty() {
            let files: Vec<String> = metadata_files
                .iter()
                .map(|(key, path)| format!("{key}={path}"))
                .collect();
            inv = inv.arg("--metadata-from-file").arg(files.join(","));
        }
        inv
    }

    /// `images create` invocation.
    #[must_use]
    pub fn image_invocation(&self, request: &ImageRequest) -> Invocation {
        let certs: Vec<String> = request
            .signature_db
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let mut inv = Invocation::new("gcloud")
            .args(["compute", "images", "create", request.name.as_str()])
            .args(["--source-disk", request.source_disk.as_str()])
            .args(["--source-disk-zone", request.source_disk_zone.as_str()])
            .args(["--project", self.project.as_str()])
            .args(["--storage-location", request.storage_location.as_str()])
            .args(["--guest-os-features", "UEFI_COMPATIBLE"]);
        if !certs.is_empty() {
            inv = inv.arg("--signature-database-file").arg(certs.join(","));
        }
        if let Some(family) = &request.family {
            inv = inv.args(["--family", family.as_str()]);
        }
        inv
    }
}

#[async_trait]
impl ComputeProvider for Gcloud {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, CloudError> {
        // gcloud reads metadata values from files; keep them only for the call.
        let scratch = tempfile::TempDir::new()?;
        let mut files = Vec::with_capacity(spec.metadata.len());
        for (key, value) in &spec.metadata {
            let path = scratch.path().join(key);
            tokio::fs::write(&path, value).await?;
            files.push((key.clone(), path.display().to_string()));
        }

        self.run(self.create_invocation(spec, &files)).await?;
        info!(instance = %spec.name, disk = %spec.disk_name, zone = %spec.zone, "Created build instance");
        Ok(spec.name.clone())
    }

    async fn instance_status(&self, id: &str) -> Result<InstanceStatus, CloudError> {
        let out = self
            .run(self.compute(&["instances", "describe", id]).arg("--format=json"))
            .await?;
        let described: DescribedInstance =
            serde_json::from_str(&out).map_err(|e| CloudError::Command {
                command: "gcloud compute instances describe".to_string(),
                message: format!("unexpected output: {e}"),
            })?;
        Ok(described.status)
    }

    async fn serial_output(&self, id: &str) -> Result<String, CloudError> {
        self.run(
            self.compute(&["instances", "get-serial-port-output", id])
                .args(["--port", "1"]),
        )
        .await
    }

    async fn stop_instance(&self, id: &str) -> Result<(), CloudError> {
        self.run(self.compute(&["instances", "stop", id])).await?;
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> Result<(), CloudError> {
        match self
            .run(self.compute(&["instances", "delete", id]).arg("--quiet"))
            .await
        {
            Ok(_) | Err(CloudError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_disk(&self, id: &str) -> Result<(), CloudError> {
        match self
            .run(self.compute(&["disks", "delete", id]).arg("--quiet"))
            .await
        {
            Ok(_) | Err(CloudError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ssh_command(&self, id: &str) -> String {
        format!(
            "gcloud compute ssh --project {} --zone {} {id}",
            self.project, self.zone
        )
    }
}

#[async_trait]
impl ImageProvider for Gcloud {
    async fn capture_from_disk(&self, request: &ImageRequest) -> Result<ImageRef, CloudError> {
        self.run(self.image_invocation(request)).await?;
        info!(image = %request.name, location = %request.storage_location, "Created image");
        Ok(ImageRef {
            project: self.project.clone(),
            name: request.name.clone(),
            family: request.family.clone(),
            storage_location: request.storage_location.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use gpu_installer::platform::command::CommandOutput;

    use super::*;

    /// Replays canned results and records invocations.
    struct Replay {
        calls: Mutex<Vec<Invocation>>,
        result: fn(&Invocation) -> CommandOutput,
    }

    #[async_trait]
    impl CommandRunner for Replay {
        async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, InstallError> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok((self.result)(invocation))
        }
    }

    fn gcloud(result: fn(&Invocation) -> CommandOutput) -> (Gcloud, Arc<Replay>) {
        let replay = Arc::new(Replay {
            calls: Mutex::new(Vec::new()),
            result,
        });
        (Gcloud::new("proj", "us-central1-a", replay.clone()), replay)
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "image-builder-ubuntu-22-binary-abcd1234".into(),
            zone: "us-central1-a".into(),
            machine_type: "g2-standard-4".into(),
            image_family: "ubuntu-2204-lts".into(),
            image_project: "ubuntu-os-cloud".into(),
            disk_name: "image-builder-ubuntu-22-binary-abcd1234-disk".into(),
            disk_size_gb: 30,
            disk_type: "pd-balanced".into(),
            network: "default".into(),
            subnet: "default".into(),
            max_run_duration: "1h".into(),
            metadata: BTreeMap::from([("startup-script".to_string(), "#!/bin/bash".to_string())]),
        }
    }

    #[test]
    fn test_create_invocation() {
        let (g, _) = gcloud(|_| ok(""));
        let inv = g.create_invocation(
            &spec(),
            &[("startup-script".to_string(), "/tmp/x/startup-script".to_string())],
        );
        let line = inv.to_string();
        assert!(line.starts_with("gcloud compute instances create image-builder-ubuntu-22-binary-abcd1234 --project proj --zone us-central1-a"));
        assert!(line.contains("--max-run-duration 1h"));
        assert!(line.contains("--create-disk auto-delete=yes,boot=yes,name=image-builder-ubuntu-22-binary-abcd1234-disk,image-family=ubuntu-2204-lts,image-project=ubuntu-os-cloud,mode=rw,size=30,type=pd-balanced"));
        assert!(line.ends_with("--metadata-from-file startup-script=/tmp/x/startup-script"));
    }

    #[test]
    fn test_image_invocation() {
        let (g, _) = gcloud(|_| ok(""));
        let inv = g.image_invocation(&ImageRequest {
            name: "gpu-image".into(),
            source_disk: "disk-1".into(),
            source_disk_zone: "us-central1-a".into(),
            storage_location: "us".into(),
            family: Some("gpu-family".into()),
            signature_db: vec!["/k/mok.der".into(), "/c/MicCorUEFCA2011_2011-06-27.crt".into()],
        });
        let line = inv.to_string();
        assert!(line.contains("--signature-database-file /k/mok.der,/c/MicCorUEFCA2011_2011-06-27.crt"));
        assert!(line.contains("--guest-os-features UEFI_COMPATIBLE"));
        assert!(line.ends_with("--family gpu-family"));
    }

    #[tokio::test]
    async fn test_status_parsing() {
        let (g, _) = gcloud(|_| ok(r#"{"name": "x", "status": "TERMINATED"}"#));
        assert_eq!(g.instance_status("x").await.unwrap(), InstanceStatus::Terminated);
    }

    #[tokio::test]
    async fn test_quota_errors_are_classified() {
        let (g, _) = gcloud(|_| failed("ERROR: Quota 'GPUS_ALL_REGIONS' exceeded. Limit: 0.0 globally."));
        let err = g.create_instance(&spec()).await.unwrap_err();
        assert!(matches!(err, CloudError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_resources_succeeds() {
        let (g, replay) = gcloud(|_| failed("ERROR: The resource 'projects/proj/zones/z/instances/x' was not found"));
        g.delete_instance("x").await.unwrap();
        g.delete_disk("x-disk").await.unwrap();
        assert_eq!(replay.calls.lock().unwrap().len(), 2);
    }
}
