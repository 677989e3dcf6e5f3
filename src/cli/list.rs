//! List command implementation.

use super::{format_size, Session};
use crate::providers::RemoteObject;
use anyhow::Result;
use clap::Args;
use std::collections::BTreeMap;

/// Arguments for the list command
#[derive(Args)]
pub struct ListArgs {
    /// Only list this provider
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the list command
pub async fn run(args: ListArgs, session: Session) -> Result<()> {
    let engine = session.engine()?;

    let listings: BTreeMap<String, Result<Vec<RemoteObject>, String>> = match &args.provider {
        Some(provider) => {
            let backups = engine.list_backups(provider).await?;
            BTreeMap::from([(provider.clone(), Ok(backups))])
        }
        None => engine
            .list_all_backups()
            .await
            .into_iter()
            .map(|(name, listing)| (name, listing.map_err(|e| e.to_string())))
            .collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }

    for (provider, listing) in &listings {
        println!("{}:", provider);
        match listing {
            Ok(backups) if backups.is_empty() => println!("  (no backups)"),
            Ok(backups) => {
                let mut backups = backups.clone();
                backups.sort_by(|a, b| b.modified.cmp(&a.modified));
                for backup in &backups {
                    println!(
                        "  {:<50} {:>10}  {}",
                        backup.name,
                        format_size(backup.size),
                        backup.modified.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!("  {} backup(s)", backups.len());
            }
            Err(e) => println!("  error: {}", e),
        }
    }
    Ok(())
}
