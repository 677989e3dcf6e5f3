//! Run reports returned by the backup engine

use crate::config::RetentionPolicy;
use crate::providers::ProviderResult;
use crate::schedule::ScheduleInfo;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Aggregate outcome of a multi-provider operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every target succeeded
    Success,
    /// At least one target succeeded and at least one failed
    Partial,
    /// No target succeeded
    Failed,
}

impl RunStatus {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a ProviderResult>) -> Self {
        let (mut ok, mut failed) = (0usize, 0usize);
        for result in results {
            if result.success {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        match (ok, failed) {
            (0, _) => RunStatus::Failed,
            (_, 0) => RunStatus::Success,
            _ => RunStatus::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `create_backup` run
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    /// Remote name the artifact was uploaded under
    pub artifact_name: String,
    pub timestamp: String,
    /// Artifact size in bytes, after encryption when applied
    pub size: u64,
    /// SHA-256 of the uploaded artifact
    pub sha256: String,
    pub encrypted: bool,
    pub results: BTreeMap<String, ProviderResult>,
    pub warnings: Vec<String>,
    pub skipped_items: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BackupReport {
    pub fn status(&self) -> RunStatus {
        RunStatus::from_results(self.results.values())
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// `Err(AllProvidersFailed)` when no provider stored the artifact
    pub fn ensure_success(&self) -> Result<()> {
        match self.status() {
            RunStatus::Failed => Err(Error::AllProvidersFailed),
            _ => Ok(()),
        }
    }
}

/// Result of retention cleanup on one provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub provider: String,
    pub examined: usize,
    pub kept: usize,
    pub deleted: Vec<String>,
    /// Deletions that failed, with the reason
    pub failed: BTreeMap<String, String>,
}

/// A scheduled run: upload everywhere, then apply retention
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledRun {
    pub backup: BackupReport,
    pub cleanup: BTreeMap<String, CleanupReport>,
    pub cleanup_errors: BTreeMap<String, String>,
}

/// One configured backup item and whether it currently exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemStatus {
    pub path: PathBuf,
    pub exists: bool,
}

/// Snapshot of the engine's configuration and schedule
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub schedule: ScheduleInfo,
    pub encryption_available: bool,
    pub providers: Vec<String>,
    pub retention: RetentionPolicy,
    pub backup_items: Vec<ItemStatus>,
}
