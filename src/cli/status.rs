//! Status command implementation.

use super::Session;
use crate::providers::ProviderStatus;
use crate::schedule::CronFileSchedule;
use anyhow::Result;
use clap::Args;
use serde::Serialize;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    config_path: &'a std::path::Path,
    #[serde(flatten)]
    engine: crate::engine::EngineStatus,
    provider_status: Vec<ProviderStatus>,
    warnings: Vec<String>,
}

/// Run the status command
pub async fn run(args: StatusArgs, session: Session) -> Result<()> {
    let engine = session.engine()?;
    let warnings = session.config.validate()?;
    let provider_status: Vec<ProviderStatus> = session
        .config
        .providers
        .iter()
        .map(|(name, config)| session.registry.status(name, config, &session.credentials))
        .collect();

    let output = StatusOutput {
        config_path: &session.config_path,
        engine: engine.status(&CronFileSchedule::default()),
        provider_status,
        warnings,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Config: {}", output.config_path.display());
    let schedule = &output.engine.schedule;
    if schedule.active {
        println!(
            "Schedule: {} (next run {})",
            schedule.expression.as_deref().unwrap_or("?"),
            schedule
                .next_run
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
    } else {
        println!("Schedule: inactive");
    }
    println!(
        "Encryption: {}",
        if output.engine.encryption_available { "available" } else { "unavailable" }
    );

    let retention = output.engine.retention;
    println!(
        "Retention: {} days, {} backups",
        retention.max_age_days.map_or("unlimited".to_string(), |d| d.to_string()),
        retention.max_count.map_or("unlimited".to_string(), |n| n.to_string())
    );

    println!("\nBackup items:");
    for item in &output.engine.backup_items {
        let mark = if item.exists { "✓" } else { "✗" };
        println!("  {} {}", mark, item.path.display());
    }

    println!("\nProviders:");
    for status in &output.provider_status {
        println!(
            "  {} ({}): {}{}{}",
            status.name,
            status.kind,
            if status.enabled { "enabled" } else { "disabled" },
            if status.available { "" } else { ", not available" },
            if status.credentials_available { "" } else { ", no credentials" },
        );
    }

    if !output.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &output.warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}
