//! Tracing setup: console output plus an append-only log next to the state files.
//!
//! Console events go to stderr; stdout carries only command output.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILE: &str = "installer.log";

/// Default filter directives.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug,hyper=info,reqwest=info,rustls=info"
    } else {
        "info"
    }
}

fn open_log(dir: &Path) -> Option<File> {
    std::fs::create_dir_all(dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))
        .ok()
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(verbose: bool, log_dir: &Path) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    // Unprivileged runs usually cannot write the installer directory.
    let file_layer = open_log(log_dir).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_log_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        assert!(open_log(&nested).is_some());
        assert!(nested.join(LOG_FILE).is_file());
    }

    #[test]
    fn test_verbose_filter() {
        assert_eq!(default_filter(false), "info");
        assert!(default_filter(true).starts_with("debug"));
    }
}
