//! Cleanup command implementation.

use super::Session;
use crate::config::RetentionPolicy;
use anyhow::Result;
use clap::Args;

/// Arguments for the cleanup command
#[derive(Args)]
pub struct CleanupArgs {
    /// Only clean this provider
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Delete backups older than this many days
    #[arg(long)]
    pub days: Option<u32>,

    /// Keep at most this many backups
    #[arg(long)]
    pub max_backups: Option<usize>,
}

impl CleanupArgs {
    /// Configured retention with command-line overrides applied
    pub fn policy(&self, configured: RetentionPolicy) -> RetentionPolicy {
        RetentionPolicy::new(
            self.days.or(configured.max_age_days),
            self.max_backups.or(configured.max_count),
        )
    }
}

/// Run the cleanup command
pub async fn run(args: CleanupArgs, session: Session) -> Result<()> {
    let policy = args.policy(session.config.retention);
    if policy.is_unbounded() {
        println!("Retention policy is unbounded, nothing to clean up");
        return Ok(());
    }
    let engine = session.engine()?;

    let outcomes = match &args.provider {
        Some(provider) => {
            let report = engine.cleanup_old_backups(provider, &policy).await;
            vec![(provider.clone(), report)]
        }
        None => engine.cleanup_all(&policy).await.into_iter().collect(),
    };

    let mut errors = 0;
    for (provider, outcome) in outcomes {
        match outcome {
            Ok(report) => {
                println!(
                    "{}: examined {}, kept {}, deleted {}",
                    provider,
                    report.examined,
                    report.kept,
                    report.deleted.len()
                );
                for name in &report.deleted {
                    println!("  - {}", name);
                }
                for (name, reason) in &report.failed {
                    println!("  ! {}: {}", name, reason);
                }
            }
            Err(e) => {
                errors += 1;
                println!("{}: cleanup failed: {}", provider, e);
            }
        }
    }

    if errors > 0 {
        anyhow::bail!("cleanup failed on {} provider(s)", errors);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_configured_limits() {
        let args = CleanupArgs {
            provider: None,
            days: Some(7),
            max_backups: None,
        };
        let policy = args.policy(RetentionPolicy::new(Some(30), Some(10)));
        assert_eq!(policy, RetentionPolicy::new(Some(7), Some(10)));
    }
}
