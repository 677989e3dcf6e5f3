//! Download command implementation.

use super::{format_size, Session};
use crate::transfer::TransferOptions;
use anyhow::{Context, Result};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the download command
#[derive(Args)]
pub struct DownloadArgs {
    /// Provider holding the backup
    #[arg(short, long)]
    pub provider: String,

    /// Backup artifact name
    pub name: String,

    /// Directory to download into
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,
}

/// Run the download command
pub async fn run(args: DownloadArgs, session: Session) -> Result<()> {
    let engine = session.engine()?;
    tokio::fs::create_dir_all(&args.output)
        .await
        .with_context(|| format!("creating {}", args.output.display()))?;

    let options = TransferOptions::new().with_progress(Arc::new(|done: u64, total: u64| {
        if total > 0 {
            eprint!("\r  {:>3}%", done * 100 / total);
            let _ = std::io::stderr().flush();
        }
    }));

    println!("Downloading {} from {}", args.name, args.provider);
    let path = engine
        .download_backup_with(&args.provider, &args.name, &args.output, options)
        .await?;
    eprintln!();

    let size = tokio::fs::metadata(&path).await?.len();
    println!("Saved {} ({})", path.display(), format_size(size));
    Ok(())
}
