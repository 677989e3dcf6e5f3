//! Backup command implementation.

use super::{format_size, Session};
use crate::config::RetentionPolicy;
use crate::engine::{BackupReport, RunStatus};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Path to back up; repeatable. Defaults to the configured items
    #[arg(short, long)]
    pub item: Vec<PathBuf>,

    /// Provider to upload to; repeatable. Defaults to every enabled provider
    #[arg(short, long)]
    pub provider: Vec<String>,

    /// Abort the run after this many seconds (0 disables the limit)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Skip retention cleanup after the upload
    #[arg(long)]
    pub no_cleanup: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the backup command
pub async fn run(args: BackupArgs, mut session: Session) -> Result<()> {
    if let Some(timeout) = args.timeout {
        session.config.run_timeout_secs = timeout;
    }
    let engine = session.engine()?;

    let items = if args.item.is_empty() {
        session.config.backup_items.clone()
    } else {
        args.item.clone()
    };
    let targets: Vec<&str> = args.provider.iter().map(String::as_str).collect();

    if !args.json {
        println!("Starting backup of {} item(s)", items.len());
    }
    let report = engine.create_backup(&items, &targets).await?;

    let retention: RetentionPolicy = session.config.retention;
    let mut cleanup_lines = Vec::new();
    if !args.no_cleanup && report.status() != RunStatus::Failed && !retention.is_unbounded() {
        for provider in report.succeeded() {
            match engine.cleanup_old_backups(provider, &retention).await {
                Ok(cleanup) => cleanup_lines.push(format!(
                    "  {}: deleted {}, kept {}",
                    provider,
                    cleanup.deleted.len(),
                    cleanup.kept
                )),
                Err(e) => cleanup_lines.push(format!("  {}: cleanup failed: {}", provider, e)),
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        if !cleanup_lines.is_empty() {
            println!("\nRetention cleanup:");
            for line in cleanup_lines {
                println!("{}", line);
            }
        }
    }

    report.ensure_success()?;
    Ok(())
}

fn print_report(report: &BackupReport) {
    println!("\nBackup {}: {}", report.status(), report.artifact_name);
    println!("  Size: {}", format_size(report.size));
    println!("  SHA-256: {}", report.sha256);
    println!("  Encrypted: {}", if report.encrypted { "yes" } else { "no" });

    println!("\nProviders:");
    for (name, result) in &report.results {
        let mark = if result.success { "✓" } else { "✗" };
        let message = result.message.as_deref().unwrap_or("");
        println!("  {} {}: {}", mark, name, message);
    }

    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  - {}", warning);
        }
    }
}
