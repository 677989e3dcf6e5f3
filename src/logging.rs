//! Tracing subscriber setup for the binary

use crate::Result;
use std::fs::OpenOptions;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn filter(verbose: bool, level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    if verbose {
        EnvFilter::new("homeserver_backup=debug")
    } else {
        EnvFilter::new(format!("homeserver_backup={}", level))
    }
}

pub fn init_logging(verbose: bool, level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose, level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Append log output to `log_file`, creating its directory
pub fn init_file_logging(log_file: &Path, verbose: bool, level: &str) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose, level))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}
