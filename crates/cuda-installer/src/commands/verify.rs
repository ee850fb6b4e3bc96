//! `verify_driver` and `verify_cuda`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use gpu_installer::capabilities::HostInfo;
use gpu_installer::config::multiregion_for;
use gpu_installer::platform::{
    HttpFetcher, LocalHost, SystemGpuDetector, SystemRunner, SystemSampleRunner,
};
use gpu_installer::verify::{verify, SampleCheck, VerificationReport};
use gpu_installer::{Branch, Target};

use crate::exit;
use crate::ui;

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Branch whose toolkit version is expected.
    #[arg(long, value_name = "BRANCH", default_value = "prod")]
    pub installation_branch: Branch,

    /// Only look for nvcc instead of compiling and running the CUDA samples.
    #[arg(long)]
    pub skip_samples: bool,

    /// Print the report as JSON and nothing else on stdout.
    #[arg(long)]
    pub json: bool,
}

fn print_report(report: &VerificationReport) {
    let gpu = report.gpu.device_id.as_deref().unwrap_or("none");
    ui::print_check_result("NVIDIA GPU", report.gpu.present, Some(gpu));
    ui::print_check_result("NVIDIA driver", report.driver_installed, None);
    if let Some(toolkit) = report.toolkit_installed {
        ui::print_check_result("CUDA Toolkit", toolkit, None);
    }
    if let Some(samples) = report.samples_passed {
        ui::print_check_result("CUDA samples", samples, Some("deviceQuery, bandwidthTest"));
    }
}

/// The report as a single JSON document.
pub fn report_json(report: &VerificationReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

fn exit_code(report: &VerificationReport) -> u8 {
    if report.is_installed() {
        exit::SUCCESS
    } else {
        exit::FAILED
    }
}

/// Check what is installed. Never modifies the host.
pub async fn run(target: Target, args: &VerifyArgs) -> Result<u8> {
    let runner = Arc::new(SystemRunner);
    let gpu = SystemGpuDetector::new(runner.clone());

    let fetcher = HttpFetcher::new().context("Failed to set up downloads")?;
    let sample_runner = SystemSampleRunner::new(runner);
    let zone = LocalHost::new().zone().await.unwrap_or_default();
    let samples = (target == Target::Cuda && !args.skip_samples).then(|| SampleCheck {
        fetcher: &fetcher,
        runner: &sample_runner,
        multiregion: multiregion_for(&zone),
    });

    let report = verify(&gpu, target, args.installation_branch, samples)
        .await
        .context("Verification could not run")?;

    if args.json {
        println!("{}", report_json(&report)?);
        return Ok(exit_code(&report));
    }

    ui::print_section(&format!("Verifying {target}"));
    print_report(&report);
    if report.is_installed() {
        ui::print_success(&format!("The {target} is installed"));
    } else {
        ui::print_error(&format!("The {target} is not installed"));
    }
    Ok(exit_code(&report))
}

#[cfg(test)]
mod tests {
    use gpu_installer::capabilities::GpuPresence;

    use super::*;

    fn report() -> VerificationReport {
        VerificationReport {
            target: Target::Cuda,
            gpu: GpuPresence::device("10de:2330"),
            driver_installed: true,
            toolkit_installed: Some(true),
            samples_passed: Some(false),
        }
    }

    #[test]
    fn test_report_json_is_one_document() {
        let json = report_json(&report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["target"], "cuda");
        assert_eq!(value["gpu"]["device_id"], "10de:2330");
        assert_eq!(value["toolkit_installed"], true);
        assert_eq!(value["samples_passed"], false);
    }

    #[test]
    fn test_exit_code_follows_report() {
        let mut report = report();
        assert_eq!(exit_code(&report), exit::FAILED);
        report.samples_passed = Some(true);
        assert_eq!(exit_code(&report), exit::SUCCESS);
    }
}
