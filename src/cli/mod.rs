//! Command-line interface for homeserver-backup.
//!
//! Each subcommand lives in its own module with an `XArgs` struct and a
//! `run` function. Shared setup (config, credentials, engine) goes through
//! [`Session`].

use crate::config::{BackupConfig, CONFIG_PATH_ENV};
use crate::credentials::ChainedCredentials;
use crate::engine::BackupEngine;
use crate::providers::ProviderRegistry;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::warn;

pub mod backup;
pub mod cleanup;
pub mod download;
pub mod list;
pub mod restore;
pub mod status;

/// Encrypted homeserver backups to local and cloud storage
#[derive(Parser)]
#[command(name = "homeserver-backup")]
#[command(about = "Archive, encrypt, and ship homeserver backups to storage providers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, global = true, env = CONFIG_PATH_ENV)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to this file instead of the configured one
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a backup and upload it to the providers
    Backup(backup::BackupArgs),
    /// List stored backups
    List(list::ListArgs),
    /// Delete backups outside the retention policy
    Cleanup(cleanup::CleanupArgs),
    /// Test provider connectivity
    Test(test::TestArgs),
    /// Download a backup artifact
    Download(download::DownloadArgs),
    /// Restore a backup into a directory
    Restore(restore::RestoreArgs),
    /// Show configuration, schedule, and provider status
    Status(status::StatusArgs),
}

/// Configuration and collaborators shared by every command
pub struct Session {
    pub config: BackupConfig,
    pub config_path: PathBuf,
    pub registry: ProviderRegistry,
    pub credentials: ChainedCredentials,
}

impl Session {
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = BackupConfig::resolve_path(explicit);
        let config = BackupConfig::load_from(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;

        Ok(Self {
            config,
            config_path,
            registry: ProviderRegistry::with_builtin(),
            credentials: ChainedCredentials::system(),
        })
    }

    /// Build the engine and cancel it on Ctrl-C
    pub fn engine(&self) -> anyhow::Result<BackupEngine> {
        self.config.validate().context("invalid configuration")?;
        let engine = BackupEngine::from_config(&self.config, &self.registry, &self.credentials)
            .context("failed to initialize providers")?;

        let token = engine.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                token.cancel();
            }
        });
        Ok(engine)
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup_flags() {
        let cli = Cli::try_parse_from([
            "homeserver-backup",
            "--verbose",
            "backup",
            "--provider",
            "local",
            "--provider",
            "aws_s3",
            "--no-cleanup",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Backup(args) => {
                assert_eq!(args.provider, vec!["local", "aws_s3"]);
                assert!(args.no_cleanup);
                assert!(args.item.is_empty());
            }
            _ => panic!("expected backup command"),
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let session = Session::load(Some(path.as_path())).unwrap();
        assert_eq!(session.config, BackupConfig::default());
    }
}
