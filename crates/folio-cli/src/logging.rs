use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const LOG_ENV: &str = "FOLIO_LOG";
pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "folio.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Installs the global subscriber: stderr in the chosen format plus an
/// append-only `<project>/logs/folio.log` when a project folder is known.
///
/// `FOLIO_LOG` takes any `EnvFilter` directive and wins over `verbose`.
pub fn init_logging(project_root: Option<&Path>, format: LogFormat, verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let file = match project_root {
        Some(root) => {
            let dir = root.join(LOG_DIR);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(file)
        }
        None => None,
    };

    let stderr_text = (format == LogFormat::Text).then(|| {
        fmt::layer()
            .with_target(false)
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(std::io::stderr)
    });
    let stderr_json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(std::io::stderr)
    });
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(Mutex::new(file))
    });

    Registry::default()
        .with(filter)
        .with(stderr_text)
        .with(stderr_json)
        .with(file_layer)
        .try_init()
        .context("failed to install log subscriber")?;
    Ok(())
}
