//! Startup script run by the build instance, and the serial markers it emits.
//!
//! The script runs on every boot of the build instance. It downloads the
//! installer from the regional mirror and re-runs it until the driver (and
//! toolkit) report completion, rebooting whenever the installer asks for it.
//! When everything is installed it runs the operator's custom script, shreds
//! the signing keys and prints a marker on the serial console:
//!
//! ```text
//! IMAGE-BUILDER-<build id>: SUCCESS
//! IMAGE-BUILDER-<build id>: FAILED <reason>
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use gpu_installer::config::INSTALLER_DIR;
use gpu_installer::{Branch, InstallMode};

pub const MARKER_PREFIX: &str = "IMAGE-BUILDER";

pub const STARTUP_SCRIPT_KEY: &str = "startup-script";
pub const PUBLIC_KEY_KEY: &str = "secure-boot-public-key";
pub const PRIVATE_KEY_KEY: &str = "secure-boot-private-key";
pub const CUSTOM_SCRIPT_KEY: &str = "custom-script";

/// Terminal signal from the build instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Success,
    Failed(String),
}

/// Inputs of the startup script.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub build_id: String,
    /// Mirror the installer binary is downloaded from.
    pub mirror: String,
    pub installer_version: String,
    pub mode: InstallMode,
    pub branch: Branch,
    pub driver_only: bool,
    pub interactive: bool,
}

/// Payloads shipped to the instance as metadata.
#[derive(Debug, Clone, Default)]
pub struct Payloads {
    pub public_key: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub custom_script: Option<Vec<u8>>,
}

impl Payloads {
    fn has_keys(&self) -> bool {
        self.public_key.is_some() && self.private_key.is_some()
    }
}

impl Bootstrap {
    /// Marker line prefix for this build.
    #[must_use]
    pub fn marker(&self) -> String {
        format!("{MARKER_PREFIX}-{}", self.build_id)
    }

    /// URL of the installer binary.
    #[must_use]
    pub fn installer_url(&self) -> String {
        format!(
            "{}/installer/{}/cuda-installer",
            self.mirror, self.installer_version
        )
    }

    /// Render the startup script.
    #[must_use]
    pub fn render(&self, payloads: &Payloads) -> String {
        let work = format!("{INSTALLER_DIR}/build");
        let mut s = String::new();

        let _ = writeln!(s, "#!/bin/bash");
        let _ = writeln!(s, "set -o pipefail");
        let _ = writeln!(s, "MARKER=\"{}\"", self.marker());
        let _ = writeln!(s, "WORK=\"{work}\"");
        let _ = writeln!(s, "INSTALLER=\"$WORK/cuda-installer\"");
        s.push_str(
            r#"
signal() {
  echo "$MARKER: $*"
  echo "$MARKER: $*" > /dev/ttyS0 2>/dev/null || true
}

attr() {
  curl -sf -H "Metadata-Flavor: Google" \
    "http://metadata.google.internal/computeMetadata/v1/instance/attributes/$1"
}

shred_keys() {
  [ -f "$WORK/mok.key" ] && shred -uz "$WORK/mok.key"
  [ -f "$WORK/mok.der" ] && shred -uz "$WORK/mok.der"
  return 0
}

fail() {
  shred_keys
  signal FAILED "$*"
  exit 1
}

mkdir -p "$WORK"
if [ -f "$WORK/done" ]; then
  exit 0
fi

"#,
        );

        let _ = writeln!(s, "if [ ! -x \"$INSTALLER\" ]; then");
        let _ = writeln!(
            s,
            "  curl -sfL -o \"$INSTALLER\" \"{}\" || fail \"installer download\"",
            self.installer_url()
        );
        let _ = writeln!(s, "  chmod +x \"$INSTALLER\"");
        let _ = writeln!(s, "fi");
        s.push('\n');

        let mut key_args = String::new();
        if payloads.has_keys() {
            let _ = writeln!(
                s,
                "attr {PUBLIC_KEY_KEY} | base64 -d > \"$WORK/mok.der\" || fail \"public key\""
            );
            let _ = writeln!(s, "(umask 077; attr {PRIVATE_KEY_KEY} | base64 -d > \"$WORK/mok.key\") || fail \"private key\"");
            s.push('\n');
            key_args = " --secure-boot-pub-key \"$WORK/mok.der\" --secure-boot-priv-key \"$WORK/mok.key\"".to_string();
        }

        let _ = writeln!(s, "run_step() {{");
        let _ = writeln!(
            s,
            "  \"$INSTALLER\" \"$1\" --installation-mode {} --installation-branch {} --ignore-no-gpu --no-reboot --no-resume{key_args}",
            self.mode, self.branch
        );
        s.push_str(
            r#"  code=$?
  case $code in
    0) return 0 ;;
    2) echo "$MARKER: REBOOT"; reboot; exit 0 ;;
    *) fail "$1 exited with $code" ;;
  esac
}

run_step install_driver
"#,
        );
        if !self.driver_only {
            let _ = writeln!(s, "run_step install_cuda");
        }

        if payloads.custom_script.is_some() {
            let _ = writeln!(s);
            let _ = writeln!(
                s,
                "attr {CUSTOM_SCRIPT_KEY} | base64 -d > \"$WORK/custom-script.sh\" || fail \"custom script download\""
            );
            let _ = writeln!(
                s,
                "bash \"$WORK/custom-script.sh\" || fail \"custom script exited with $?\""
            );
            let _ = writeln!(s, "rm -f \"$WORK/custom-script.sh\"");
        }

        s.push_str(
            r#"
shred_keys
touch "$WORK/done"
signal SUCCESS
"#,
        );
        if !self.interactive {
            let _ = writeln!(s, "shutdown -h now");
        }
        s
    }

    /// Instance metadata: the startup script plus base64 payloads.
    #[must_use]
    pub fn metadata(&self, payloads: &Payloads) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert(STARTUP_SCRIPT_KEY.to_string(), self.render(payloads));
        if let (Some(public), Some(private)) = (&payloads.public_key, &payloads.private_key) {
            metadata.insert(PUBLIC_KEY_KEY.to_string(), STANDARD.encode(public));
            metadata.insert(PRIVATE_KEY_KEY.to_string(), STANDARD.encode(private));
        }
        if let Some(script) = &payloads.custom_script {
            metadata.insert(CUSTOM_SCRIPT_KEY.to_string(), STANDARD.encode(script));
        }
        metadata
    }
}

/// Find the terminal marker for `build_id` in serial console output.
#[must_use]
pub fn scan_serial(output: &str, build_id: &str) -> Option<Signal> {
    let marker = format!("{MARKER_PREFIX}-{build_id}: ");
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(&marker)?;
        let rest = rest.trim();
        if rest == "SUCCESS" {
            Some(Signal::Success)
        } else {
            rest.strip_prefix("FAILED")
                .map(|reason| Signal::Failed(reason.trim().to_string()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap() -> Bootstrap {
        Bootstrap {
            build_id: "abcd1234".into(),
            mirror: "https://storage.googleapis.com/compute-gpu-installation-us".into(),
            installer_version: "v1.7.0".into(),
            mode: InstallMode::Binary,
            branch: Branch::Production,
            driver_only: false,
            interactive: false,
        }
    }

    #[test]
    fn test_script_runs_both_targets_and_powers_off() {
        let script = bootstrap().render(&Payloads::default());
        assert!(script.contains("MARKER=\"IMAGE-BUILDER-abcd1234\""));
        assert!(script.contains("https://storage.googleapis.com/compute-gpu-installation-us/installer/v1.7.0/cuda-installer"));
        assert!(script.contains("--installation-mode binary --installation-branch prod --ignore-no-gpu --no-reboot --no-resume\n"));
        assert!(script.contains("run_step install_driver\nrun_step install_cuda"));
        assert!(script.trim_end().ends_with("shutdown -h now"));
        assert!(!script.contains("mok.der\" ||"));
        assert!(!script.contains(CUSTOM_SCRIPT_KEY));
    }

    #[test]
    fn test_script_driver_only_interactive() {
        let mut b = bootstrap();
        b.driver_only = true;
        b.interactive = true;
        b.mode = InstallMode::Repository;
        b.branch = Branch::NewFeature;
        let script = b.render(&Payloads::default());
        assert!(script.contains("--installation-mode repo --installation-branch nfb"));
        assert!(!script.contains("install_cuda"));
        assert!(!script.contains("shutdown -h now"));
        assert!(script.trim_end().ends_with("signal SUCCESS"));
    }

    #[test]
    fn test_metadata_carries_keys_and_script() {
        let payloads = Payloads {
            public_key: Some(b"pub".to_vec()),
            private_key: Some(b"priv".to_vec()),
            custom_script: Some(b"echo hi".to_vec()),
        };
        let metadata = bootstrap().metadata(&payloads);

        assert_eq!(metadata[PUBLIC_KEY_KEY], "cHVi");
        assert_eq!(metadata[PRIVATE_KEY_KEY], "cHJpdg==");
        assert_eq!(metadata[CUSTOM_SCRIPT_KEY], "ZWNobyBoaQ==");
        let script = &metadata[STARTUP_SCRIPT_KEY];
        assert!(script.contains("--secure-boot-pub-key \"$WORK/mok.der\" --secure-boot-priv-key \"$WORK/mok.key\""));
        assert!(script.contains("bash \"$WORK/custom-script.sh\""));
    }

    #[test]
    fn test_scan_serial() {
        let log = "\
Oct 16 10:00:01 host google_metadata_script_runner[912]: startup-script: IMAGE-BUILDER-abcd1234: REBOOT
Oct 16 10:05:12 host google_metadata_script_runner[911]: startup-script: IMAGE-BUILDER-ffff0000: SUCCESS
";
        assert_eq!(scan_serial(log, "abcd1234"), None);

        let done = format!("{log}IMAGE-BUILDER-abcd1234: SUCCESS\n");
        assert_eq!(scan_serial(&done, "abcd1234"), Some(Signal::Success));

        let failed = format!("{log}IMAGE-BUILDER-abcd1234: FAILED install_driver exited with 1\n");
        assert_eq!(
            scan_serial(&failed, "abcd1234"),
            Some(Signal::Failed("install_driver exited with 1".into()))
        );
    }
}
