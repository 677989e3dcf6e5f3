//! Restore workflow: fetch an artifact, decrypt it, unpack it
//!
//! Downloads land in a run-unique scratch directory that is removed on every
//! exit path, so a failed restore leaves nothing behind but what was already
//! extracted into the target.

use crate::archive::{self, ArchiveEntry, ArchiveMetadata};
use crate::engine::{BackupEngine, RunDir};
use crate::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, info_span, Instrument};

/// Outcome of a successful restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_name: String,
    pub provider: String,
    pub target_dir: PathBuf,
    pub encrypted: bool,
    /// Entries written into the target, excluding the metadata entry
    pub entries: usize,
    pub bytes: u64,
    pub metadata: Option<ArchiveMetadata>,
}

/// Contents of a remote backup, read without extracting
#[derive(Debug, Clone, Serialize)]
pub struct BackupInspection {
    pub backup_name: String,
    pub encrypted: bool,
    pub entries: Vec<ArchiveEntry>,
    pub metadata: Option<ArchiveMetadata>,
}

/// Restore `name` from `provider` into `target_dir`.
///
/// Encrypted artifacts need the engine's key; without one the restore fails
/// before anything is extracted.
pub async fn restore_backup(
    engine: &BackupEngine,
    provider: &str,
    name: &str,
    target_dir: &Path,
) -> Result<RestoreReport> {
    let span = info_span!("restore", provider = %provider, backup = %name);
    async {
        let run_dir = RunDir::create(&engine.settings().temp_dir)?;
        let archive_path = fetch_archive(engine, provider, name, run_dir.path()).await?;

        let target = target_dir.to_path_buf();
        let (summary, metadata) = blocking(move || {
            let metadata = archive::read_metadata(&archive_path)?;
            let summary = archive::extract_archive(&archive_path, &target)?;
            Ok((summary, metadata))
        })
        .await?;

        info!(entries = summary.entries, bytes = summary.bytes, "Restore completed");
        Ok::<_, Error>(RestoreReport {
            backup_name: name.to_string(),
            provider: provider.to_string(),
            target_dir: target_dir.to_path_buf(),
            encrypted: archive::is_encrypted_name(name),
            entries: summary.entries,
            bytes: summary.bytes,
            metadata,
        })
    }
    .instrument(span)
    .await
}

/// List the entries and embedded metadata of a remote backup
pub async fn inspect_backup(engine: &BackupEngine, provider: &str, name: &str) -> Result<BackupInspection> {
    let run_dir = RunDir::create(&engine.settings().temp_dir)?;
    let archive_path = fetch_archive(engine, provider, name, run_dir.path()).await?;

    let (entries, metadata) = blocking(move || {
        let entries = archive::list_archive(&archive_path)?;
        let metadata = archive::read_metadata(&archive_path)?;
        Ok((entries, metadata))
    })
    .await?;

    Ok(BackupInspection {
        backup_name: name.to_string(),
        encrypted: archive::is_encrypted_name(name),
        entries,
        metadata,
    })
}

/// Download `name` into `scratch` and return the path of the plain archive
async fn fetch_archive(engine: &BackupEngine, provider: &str, name: &str, scratch: &Path) -> Result<PathBuf> {
    if !archive::is_artifact_name(name) {
        return Err(Error::config(format!("'{}' is not a backup artifact", name)));
    }

    let downloaded = engine.download_backup(provider, name, scratch).await?;
    if !archive::is_encrypted_name(name) {
        return Ok(downloaded);
    }

    if !engine.encryption().is_encryption_available() {
        return Err(Error::Encryption {
            reason: format!("{} is encrypted and no key is available", name),
        });
    }

    let plain = scratch.join("archive.tar.gz");
    let manager = engine.encryption_handle();
    let src = downloaded.clone();
    let dst = plain.clone();
    blocking(move || {
        manager.decrypt_file(&src, &dst)?;
        std::fs::remove_file(&src)?;
        Ok(())
    })
    .await?;
    Ok(plain)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| Error::Archive {
        reason: format!("restore task failed: {}", e),
    })?
}
