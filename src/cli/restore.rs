//! Restore command implementation.

use super::{format_size, Session};
use crate::restore::{inspect_backup, restore_backup};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Provider holding the backup
    #[arg(short, long)]
    pub provider: String,

    /// Backup artifact name
    pub name: String,

    /// Directory to extract into
    #[arg(short, long, required_unless_present = "inspect")]
    pub target: Option<PathBuf>,

    /// List the archive contents without extracting
    #[arg(long)]
    pub inspect: bool,
}

/// Run the restore command
pub async fn run(args: RestoreArgs, session: Session) -> Result<()> {
    let engine = session.engine()?;

    if args.inspect {
        let inspection = inspect_backup(&engine, &args.provider, &args.name).await?;
        if let Some(metadata) = &inspection.metadata {
            println!("Backup {} created {}", metadata.backup_name, metadata.created_at);
            for item in &metadata.items {
                println!("  {} <- {}", item.backup_name, item.source_path.display());
            }
        }
        println!("\nEntries:");
        for entry in &inspection.entries {
            let kind = if entry.is_dir { "d" } else { "-" };
            println!("  {} {:>10}  {}", kind, format_size(entry.size), entry.path.display());
        }
        return Ok(());
    }

    let Some(target) = args.target else {
        anyhow::bail!("--target is required unless --inspect is given");
    };
    println!("Restoring {} from {} into {}", args.name, args.provider, target.display());
    let report = restore_backup(&engine, &args.provider, &args.name, &target).await?;
    println!(
        "Restored {} entries ({})",
        report.entries,
        format_size(report.bytes)
    );
    Ok(())
}
