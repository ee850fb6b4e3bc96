//! `status` and `reset`: inspect or discard persisted installation state.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use gpu_installer::capabilities::HostInfo;
use gpu_installer::platform::LocalHost;
use gpu_installer::{InstallationState, StateStore, Target};

use crate::exit;
use crate::ui;

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Only show this target (driver or cuda).
    #[arg(long, value_parser = parse_target)]
    pub target: Option<Target>,

    /// Print the raw state as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    /// Target whose state is discarded (driver or cuda).
    #[arg(long, value_parser = parse_target)]
    pub target: Target,
}

pub fn parse_target(s: &str) -> Result<Target, String> {
    match s {
        "driver" => Ok(Target::Driver),
        "cuda" => Ok(Target::Cuda),
        other => Err(format!("unknown target '{other}' (expected driver or cuda)")),
    }
}

fn print_state(state: &InstallationState) {
    let completed: Vec<String> = state
        .stages_completed
        .iter()
        .map(ToString::to_string)
        .collect();

    ui::print_kv("branch", &state.branch.to_string());
    ui::print_kv("mode", &state.mode.to_string());
    ui::print_kv(
        "completed stages",
        if completed.is_empty() {
            "none".to_string()
        } else {
            completed.join(", ")
        }
        .as_str(),
    );
    if let Some(stage) = state.pending_reboot_for {
        ui::print_kv("waiting for reboot after", &stage.to_string());
    }
    if let Some(failure) = &state.last_error {
        ui::print_warning(&format!(
            "last failure in '{}' ({}): {}",
            failure.stage, failure.kind, failure.message
        ));
    }
    match state.completed_at {
        Some(at) => ui::print_success(&format!("complete since {}", at.to_rfc3339())),
        None => ui::print_info(&format!("in progress, updated {}", state.updated_at.to_rfc3339())),
    }
}

fn load_states(
    store: &StateStore,
    targets: &[Target],
) -> Result<Vec<(Target, Option<InstallationState>)>> {
    targets
        .iter()
        .map(|&target| {
            let state = store
                .load(target)
                .with_context(|| format!("Failed to read the {target} state"))?;
            Ok((target, state))
        })
        .collect()
}

/// One object keyed by target, `null` for targets never started.
pub fn status_json(states: &[(Target, Option<InstallationState>)]) -> Result<serde_json::Value> {
    let mut object = serde_json::Map::new();
    for (target, state) in states {
        object.insert(target.to_string(), serde_json::to_value(state)?);
    }
    Ok(serde_json::Value::Object(object))
}

/// Show persisted progress.
pub fn status(args: &StatusArgs, dir: &Path) -> Result<u8> {
    let store = StateStore::new(dir);
    let targets = match args.target {
        Some(target) => vec![target],
        None => vec![Target::Driver, Target::Cuda],
    };
    let states = load_states(&store, &targets)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status_json(&states)?)?);
        return Ok(exit::SUCCESS);
    }
    for (target, state) in states {
        ui::print_section(&format!("{target} installation"));
        match state {
            Some(state) => print_state(&state),
            None => ui::print_info("not started"),
        }
    }
    Ok(exit::SUCCESS)
}

/// Archive a target's state so the next install starts from scratch.
pub fn reset(args: &ResetArgs, dir: &Path) -> Result<u8> {
    let store = StateStore::new(dir);
    let boot_id = LocalHost::new().boot_id()?;
    let _lock = store.lock(args.target, &boot_id)?;

    match store.archive(args.target)? {
        Some(path) => ui::print_success(&format!(
            "The {} state was moved to {}",
            args.target,
            path.display()
        )),
        None => ui::print_info(&format!("No {} state to reset", args.target)),
    }
    Ok(exit::SUCCESS)
}

#[cfg(test)]
mod tests {
    use gpu_installer::config::InstallRequest;

    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("cuda").unwrap(), Target::Cuda);
        assert!(parse_target("toolkit").is_err());
    }

    #[test]
    fn test_status_without_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = StatusArgs {
            target: None,
            json: false,
        };
        assert_eq!(status(&args, dir.path()).unwrap(), exit::SUCCESS);
    }

    #[test]
    fn test_status_reads_saved_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = InstallationState::new(&InstallRequest::new(Target::Driver));
        store.save(&mut state).unwrap();

        let args = StatusArgs {
            target: Some(Target::Driver),
            json: true,
        };
        assert_eq!(status(&args, dir.path()).unwrap(), exit::SUCCESS);
    }

    #[test]
    fn test_status_json_is_one_object_per_invocation() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = InstallationState::new(&InstallRequest::new(Target::Driver));
        store.save(&mut state).unwrap();

        let states = load_states(&store, &[Target::Driver, Target::Cuda]).unwrap();
        let text = serde_json::to_string_pretty(&status_json(&states).unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(value["driver"]["target"], "driver");
        assert!(value["cuda"].is_null());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("cuda-state.json"), "{not json").unwrap();
        let args = StatusArgs {
            target: Some(Target::Cuda),
            json: false,
        };
        assert!(status(&args, dir.path()).is_err());
    }
}
