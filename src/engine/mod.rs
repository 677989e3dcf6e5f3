//! Backup orchestration.
//!
//! [`BackupEngine`] builds one archive per run, encrypts it when a key is
//! available, and fans the artifact out to every target provider in
//! parallel. A provider failure is recorded in the run's [`BackupReport`]
//! and never stops the other uploads. Cleanup and uploads on the same
//! provider are serialised through a per-provider lock.

mod report;
mod retention;
mod run;

pub use report::{
    BackupReport, CleanupReport, EngineStatus, ItemStatus, RunStatus, ScheduledRun,
};
pub use retention::select_expired;

pub(crate) use run::RunDir;

use crate::archive::{self, ArchiveBuilder, ARTIFACT_PREFIX};
use crate::config::{BackupConfig, RetentionPolicy};
use crate::credentials::CredentialLookup;
use crate::crypto::EncryptionManager;
use crate::providers::{Provider, ProviderRegistry, ProviderResult, RemoteObject};
use crate::schedule::ScheduleStatus;
use crate::transfer::{ErrorClass, ProviderError, TransferOptions};
use crate::{Error, Result};
use chrono::{Local, Utc};
use futures::FutureExt;
use run::RunTimer;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Engine-wide settings taken from [`BackupConfig`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backup_items: Vec<PathBuf>,
    pub retention: RetentionPolicy,
    pub timestamp_format: String,
    pub temp_dir: PathBuf,
    pub max_parallel_uploads: usize,
    pub run_timeout: Option<Duration>,
    pub list_limit: usize,
}

impl EngineSettings {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            backup_items: config.backup_items.clone(),
            retention: config.retention,
            timestamp_format: config.timestamp_format.clone(),
            temp_dir: config.temp_dir.clone(),
            max_parallel_uploads: config.max_parallel_uploads.max(1),
            run_timeout: config.run_timeout(),
            list_limit: config.list_limit.max(1),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}

/// A provider plus the lock serialising uploads against cleanup
#[derive(Clone)]
struct ProviderSlot {
    provider: Arc<dyn Provider>,
    lock: Arc<Mutex<()>>,
}

/// Orchestrates archive, encryption, and multi-provider upload
pub struct BackupEngine {
    providers: BTreeMap<String, ProviderSlot>,
    encryption: Arc<EncryptionManager>,
    archiver: ArchiveBuilder,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("encryption", &self.encryption)
            .field("settings", &self.settings)
            .finish()
    }
}

impl BackupEngine {
    /// Engine with no providers; add them with [`BackupEngine::with_provider`]
    pub fn new(settings: EngineSettings, encryption: EncryptionManager) -> Self {
        Self {
            providers: BTreeMap::new(),
            encryption: Arc::new(encryption),
            archiver: ArchiveBuilder::default(),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Build every enabled provider from configuration.
    ///
    /// An unknown, unsupported, or misconfigured provider fails the whole
    /// construction before any I/O is attempted.
    pub fn from_config(
        config: &BackupConfig,
        registry: &ProviderRegistry,
        credentials: &dyn CredentialLookup,
    ) -> Result<Self> {
        let encryption = EncryptionManager::from_lookup(credentials, &config.encryption)?;
        let mut engine = Self::new(EngineSettings::from_config(config), encryption)
            .with_archiver(ArchiveBuilder::from_config(&config.compression));

        for (name, provider_config) in config.enabled_providers() {
            let provider = registry.create(name, provider_config, credentials)?;
            engine = engine.with_provider(provider);
        }

        info!(
            providers = engine.providers.len(),
            encryption = engine.encryption.is_encryption_available(),
            "Backup engine initialized"
        );
        Ok(engine)
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        let name = provider.name().to_string();
        self.providers.insert(
            name,
            ProviderSlot {
                provider,
                lock: Arc::new(Mutex::new(())),
            },
        );
        self
    }

    pub fn with_archiver(mut self, archiver: ArchiveBuilder) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn encryption(&self) -> &EncryptionManager {
        &self.encryption
    }

    pub(crate) fn encryption_handle(&self) -> Arc<EncryptionManager> {
        self.encryption.clone()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn provider(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.slot(name).map(|slot| slot.provider.clone())
    }

    fn slot(&self, name: &str) -> Result<&ProviderSlot> {
        self.providers.get(name).ok_or_else(|| Error::UnknownProvider {
            name: name.to_string(),
        })
    }

    /// Cancel in-flight and future runs of this engine
    pub fn cancel(&self) {
        warn!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Archive `items`, encrypt, and upload to `targets` (every provider when
    /// empty).
    ///
    /// Unknown targets and an item list with nothing on disk are errors. A
    /// provider failing is not: it shows up in the report, and the other
    /// providers are still attempted. The local artifact is removed once
    /// every provider has been tried.
    pub async fn create_backup(&self, items: &[PathBuf], targets: &[&str]) -> Result<BackupReport> {
        let targets = self.resolve_targets(targets)?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let span = info_span!("create_backup", run_id = %run_id);
        self.create_backup_inner(items, targets).instrument(span).await
    }

    async fn create_backup_inner(&self, items: &[PathBuf], targets: Vec<String>) -> Result<BackupReport> {
        let started_at = Utc::now();
        let token = self.cancel.child_token();
        let _timer = RunTimer::start(token.clone(), self.settings.run_timeout);
        let run_dir = RunDir::create(&self.settings.temp_dir)?;

        let timestamp = archive::format_timestamp(Local::now(), &self.settings.timestamp_format);
        info!(timestamp = %timestamp, items = items.len(), targets = ?targets, "Starting backup");

        let archiver = self.archiver.clone();
        let item_list = items.to_vec();
        let out_dir = run_dir.path().to_path_buf();
        let ts = timestamp.clone();
        let built = tokio::task::spawn_blocking(move || archiver.build(&item_list, &ts, &out_dir))
            .await
            .map_err(|e| Error::Archive {
                reason: format!("archive task failed: {}", e),
            })??;

        let mut warnings = Vec::new();
        for skipped in &built.skipped {
            warnings.push(format!("Backup item not found: {}", skipped.display()));
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (artifact_path, artifact_name, encrypted) = if self.encryption.is_encryption_available() {
            let encrypted_name = archive::encrypted_name(&built.name);
            let encrypted_path = run_dir.path().join(&encrypted_name);
            let manager = self.encryption.clone();
            let plain = built.path.clone();
            let target = encrypted_path.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                manager.encrypt_file(&plain, &target)?;
                std::fs::remove_file(&plain)?;
                Ok(())
            })
            .await
            .map_err(|e| Error::Encryption {
                reason: format!("encryption task failed: {}", e),
            })??;
            (encrypted_path, encrypted_name, true)
        } else {
            warn!(
                artifact = %built.name,
                "Encryption unavailable, uploading unencrypted artifact"
            );
            warnings.push("Encryption unavailable: artifact uploaded unencrypted".to_string());
            (built.path.clone(), built.name.clone(), false)
        };

        let hash_path = artifact_path.clone();
        let (size, sha256) = tokio::task::spawn_blocking(move || sha256_file(&hash_path))
            .await
            .map_err(|e| Error::Archive {
                reason: format!("hash task failed: {}", e),
            })??;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!(artifact = %artifact_name, bytes = size, encrypted, "Artifact ready, uploading");
        let results = self
            .upload_to_all(&artifact_path, &artifact_name, &targets, &token)
            .await;

        // Every provider has been attempted; drop the artifact now
        drop(run_dir);

        let report = BackupReport {
            artifact_name,
            timestamp,
            size,
            sha256,
            encrypted,
            results,
            warnings,
            skipped_items: built.skipped,
            started_at,
            finished_at: Utc::now(),
        };

        match report.status() {
            RunStatus::Success => info!(artifact = %report.artifact_name, "Backup completed"),
            RunStatus::Partial => warn!(
                artifact = %report.artifact_name,
                failed = ?report.failed(),
                "Backup partially completed"
            ),
            RunStatus::Failed => error!(artifact = %report.artifact_name, "Backup failed on every provider"),
        }
        Ok(report)
    }

    fn resolve_targets(&self, targets: &[&str]) -> Result<Vec<String>> {
        let targets: Vec<String> = if targets.is_empty() {
            self.providers.keys().cloned().collect()
        } else {
            let mut resolved = Vec::new();
            for name in targets {
                self.slot(name)?;
                if !resolved.iter().any(|r| r == name) {
                    resolved.push(name.to_string());
                }
            }
            resolved
        };

        if targets.is_empty() {
            return Err(Error::config("no enabled providers"));
        }
        Ok(targets)
    }

    /// Upload one artifact to each target concurrently, bounded by
    /// `max_parallel_uploads`
    async fn upload_to_all(
        &self,
        artifact: &Path,
        remote: &str,
        targets: &[String],
        token: &CancellationToken,
    ) -> BTreeMap<String, ProviderResult> {
        let permits = Arc::new(Semaphore::new(
            self.settings.max_parallel_uploads.min(targets.len()).max(1),
        ));
        let mut tasks = JoinSet::new();

        for name in targets {
            let Some(slot) = self.providers.get(name).cloned() else {
                continue;
            };
            let name = name.clone();
            let permits = permits.clone();
            let artifact = artifact.to_path_buf();
            let remote = remote.to_string();
            let options = TransferOptions::new().with_cancel(token.child_token());

            tasks.spawn(
                async move {
                    let upload = async {
                        let _permit = permits.acquire_owned().await.ok();
                        if options.is_cancelled() {
                            return ProviderResult::failed(
                                &name,
                                &ProviderError::cancelled("upload not started: run cancelled"),
                            );
                        }
                        let _guard = slot.lock.lock().await;
                        slot.provider.upload(&artifact, &remote, &options).await
                    };

                    let result = match AssertUnwindSafe(upload).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            error!(provider = %name, "Upload task panicked");
                            ProviderResult::failed(&name, &ProviderError::permanent("upload task panicked"))
                        }
                    };
                    (name, result)
                }
                .in_current_span(),
            );
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => {
                    results.insert(name, result);
                }
                Err(e) => error!("Upload task failed to complete: {}", e),
            }
        }

        for name in targets {
            results.entry(name.clone()).or_insert_with(|| {
                ProviderResult::failed(name, &ProviderError::permanent("upload task did not complete"))
            });
        }
        results
    }

    /// Configured items to every provider, then retention cleanup on each.
    ///
    /// Cleanup starts only after all uploads have finished.
    pub async fn run_scheduled_backup(&self) -> Result<ScheduledRun> {
        let backup = self.create_backup(&self.settings.backup_items, &[]).await?;

        let mut cleanup = BTreeMap::new();
        let mut cleanup_errors = BTreeMap::new();
        if self.settings.retention.is_unbounded() {
            info!("Retention is unbounded, skipping cleanup");
        } else if !self.cancel.is_cancelled() {
            for (name, outcome) in self.cleanup_all(&self.settings.retention).await {
                match outcome {
                    Ok(report) => {
                        cleanup.insert(name, report);
                    }
                    Err(e) => {
                        cleanup_errors.insert(name, e.to_string());
                    }
                }
            }
        }

        Ok(ScheduledRun {
            backup,
            cleanup,
            cleanup_errors,
        })
    }

    /// The newest `list_limit` backups stored on `provider`, newest name last
    pub async fn list_backups(&self, provider: &str) -> Result<Vec<RemoteObject>> {
        let slot = self.slot(provider)?;
        let mut objects = all_artifacts(slot.provider.as_ref()).await?;
        let excess = objects.len().saturating_sub(self.settings.list_limit);
        objects.drain(..excess);
        Ok(objects)
    }

    /// Listing of every provider; one failing provider does not hide the rest
    pub async fn list_all_backups(&self) -> BTreeMap<String, Result<Vec<RemoteObject>>> {
        let listings = self.providers.keys().map(|name| async move {
            (name.clone(), self.list_backups(name).await)
        });
        futures::future::join_all(listings).await.into_iter().collect()
    }

    /// Delete backups on `provider` that fall outside `policy`.
    ///
    /// Waits for any upload in progress on that provider. A failed deletion
    /// is recorded and the rest of the batch continues.
    pub async fn cleanup_old_backups(&self, provider: &str, policy: &RetentionPolicy) -> Result<CleanupReport> {
        let slot = self.slot(provider)?;
        let span = info_span!("cleanup", provider = %provider);
        async {
            let _guard = slot.lock.lock().await;
            let objects = all_artifacts(slot.provider.as_ref()).await?;

            let examined = objects.len();
            let (keep, expired) = select_expired(objects, policy, Utc::now());
            let mut report = CleanupReport {
                provider: provider.to_string(),
                examined,
                kept: keep.len(),
                ..Default::default()
            };

            for object in expired {
                if self.cancel.is_cancelled() {
                    warn!("Cleanup cancelled");
                    break;
                }
                let result = slot.provider.delete(&object.name).await;
                if result.success {
                    info!(backup = %object.name, "Deleted expired backup");
                    report.deleted.push(object.name);
                } else {
                    let reason = result.message.unwrap_or_else(|| "delete failed".to_string());
                    warn!(backup = %object.name, "Failed to delete expired backup: {}", reason);
                    report.failed.insert(object.name, reason);
                }
            }

            info!(
                examined = report.examined,
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Cleanup finished"
            );
            Ok::<_, Error>(report)
        }
        .instrument(span)
        .await
    }

    /// Apply `policy` on every provider, one provider at a time
    pub async fn cleanup_all(&self, policy: &RetentionPolicy) -> BTreeMap<String, Result<CleanupReport>> {
        let mut reports = BTreeMap::new();
        for name in self.providers.keys() {
            let outcome = self.cleanup_old_backups(name, policy).await;
            if let Err(e) = &outcome {
                error!(provider = %name, "Cleanup failed: {}", e);
            }
            reports.insert(name.clone(), outcome);
        }
        reports
    }

    /// `test_connection` on every provider, run concurrently
    pub async fn test_all_providers(&self) -> BTreeMap<String, bool> {
        let checks = self.providers.iter().map(|(name, slot)| async move {
            let ok = AssertUnwindSafe(slot.provider.test_connection())
                .catch_unwind()
                .await
                .unwrap_or(false);
            if ok {
                info!(provider = %name, "Connection test passed");
            } else {
                warn!(provider = %name, "Connection test failed");
            }
            (name.clone(), ok)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }

    /// Fetch `name` from `provider` into `dest_dir`, returning the local path
    pub async fn download_backup(&self, provider: &str, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.download_backup_with(provider, name, dest_dir, TransferOptions::new()).await
    }

    /// [`BackupEngine::download_backup`] with progress reporting
    pub async fn download_backup_with(
        &self,
        provider: &str,
        name: &str,
        dest_dir: &Path,
        options: TransferOptions,
    ) -> Result<PathBuf> {
        let slot = self.slot(provider)?;
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| Error::config(format!("invalid backup name '{}'", name)))?;
        let dest = dest_dir.join(file_name);
        let options = options.with_cancel(self.cancel.child_token());

        let result = slot.provider.download(name, &dest, &options).await;
        if result.success {
            Ok(dest)
        } else {
            Err(Error::Provider {
                provider: provider.to_string(),
                class: result.error.unwrap_or(ErrorClass::Permanent),
                message: result.message.unwrap_or_else(|| "download failed".to_string()),
            })
        }
    }

    pub fn status(&self, schedule: &dyn ScheduleStatus) -> EngineStatus {
        EngineStatus {
            schedule: schedule.status(),
            encryption_available: self.encryption.is_encryption_available(),
            providers: self.providers.keys().cloned().collect(),
            retention: self.settings.retention,
            backup_items: self
                .settings
                .backup_items
                .iter()
                .map(|path| ItemStatus {
                    path: path.clone(),
                    exists: path.exists(),
                })
                .collect(),
        }
    }
}

/// Size and hex SHA-256 of a file
/// Every backup artifact on `provider`, sorted by name.
///
/// Retention must see the whole set, so the listing is not bounded.
async fn all_artifacts(provider: &dyn Provider) -> Result<Vec<RemoteObject>> {
    let mut objects: Vec<_> = provider
        .list(ARTIFACT_PREFIX, usize::MAX)
        .await?
        .into_iter()
        .filter(|o| archive::is_artifact_name(&o.name))
        .collect();
    objects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(objects)
}

fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::providers::local::LocalProvider;
    use crate::schedule::{ScheduleInfo, StaticSchedule};
    use crate::transfer::{run_with_retry, RetryPolicy};
    use async_trait::async_trait;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// In-memory provider with scriptable failures
    struct MemoryProvider {
        name: String,
        objects: std::sync::Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
        /// Transient failures before uploads start succeeding; `u32::MAX` never succeeds
        failures: u32,
        attempts: AtomicU32,
        retry: RetryPolicy,
    }

    impl MemoryProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                objects: Default::default(),
                failures: 0,
                attempts: AtomicU32::new(0),
                retry: RetryPolicy::new(3, Duration::from_millis(1)),
            }
        }

        fn failing(name: &str, failures: u32) -> Self {
            Self {
                failures,
                ..Self::new(name)
            }
        }

        fn insert(&self, name: &str, modified: DateTime<Utc>) {
            self.objects
                .lock()
                .unwrap()
                .insert(name.to_string(), (b"data".to_vec(), modified));
        }

        fn names(&self) -> Vec<String> {
            let mut names: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
            names.sort();
            names
        }
    }

    #[async_trait]
    impl Provider for MemoryProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &'static str {
            "memory"
        }

        async fn upload(&self, local: &Path, remote: &str, options: &TransferOptions) -> ProviderResult {
            let outcome = run_with_retry(&self.retry, &options.cancel, "memory upload", |_| async move {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.failures {
                    return Err(ProviderError::transient("simulated outage"));
                }
                let bytes = std::fs::read(local).map_err(|e| ProviderError::io("read", e))?;
                self.objects
                    .lock()
                    .unwrap()
                    .insert(remote.to_string(), (bytes, Utc::now()));
                Ok("stored".to_string())
            })
            .await;
            match outcome {
                Ok(message) => ProviderResult::ok(&self.name, message),
                Err(err) => ProviderResult::failed(&self.name, &err),
            }
        }

        async fn download(&self, remote: &str, local: &Path, _options: &TransferOptions) -> ProviderResult {
            let bytes = self.objects.lock().unwrap().get(remote).map(|(b, _)| b.clone());
            match bytes {
                Some(bytes) => match std::fs::write(local, bytes) {
                    Ok(()) => ProviderResult::ok(&self.name, "downloaded"),
                    Err(e) => ProviderResult::failed(&self.name, &ProviderError::io("write", e)),
                },
                None => ProviderResult::failed(&self.name, &ProviderError::not_found(remote)),
            }
        }

        async fn list(&self, prefix: &str, max_results: usize) -> Result<Vec<RemoteObject>> {
            let mut objects: Vec<_> = self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, (bytes, modified))| RemoteObject::new(name.clone(), bytes.len() as u64, *modified))
                .collect();
            objects.sort_by(|a, b| a.name.cmp(&b.name));
            objects.truncate(max_results);
            Ok(objects)
        }

        async fn delete(&self, remote: &str) -> ProviderResult {
            match self.objects.lock().unwrap().remove(remote) {
                Some(_) => ProviderResult::ok(&self.name, "deleted"),
                None => ProviderResult::failed(&self.name, &ProviderError::not_found(remote)),
            }
        }

        async fn test_connection(&self) -> bool {
            self.failures != u32::MAX
        }
    }

    struct Fixture {
        _dir: TempDir,
        item: PathBuf,
        store: PathBuf,
        settings: EngineSettings,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let item = dir.path().join("a.txt");
        std::fs::write(&item, "hello").unwrap();
        let store = dir.path().join("store");
        let settings = EngineSettings {
            backup_items: vec![item.clone()],
            temp_dir: dir.path().join("tmp"),
            ..EngineSettings::default()
        };
        Fixture {
            _dir: dir,
            item,
            store,
            settings,
        }
    }

    fn secret_manager() -> EncryptionManager {
        let lookup = StaticCredentials::new().with_secret("backup", "correct horse battery staple");
        EncryptionManager::from_lookup(&lookup, &Default::default()).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_local_and_stub() {
        let fx = fixture();
        let remote = Arc::new(MemoryProvider::new("remote"));
        let engine = BackupEngine::new(fx.settings.clone(), secret_manager())
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)))
            .with_provider(remote.clone());

        let report = engine.create_backup(&[fx.item.clone()], &[]).await.unwrap();
        assert_eq!(report.status(), RunStatus::Success);
        assert!(report.encrypted);
        assert!(report.results["local"].success);
        assert!(report.results["remote"].success);
        assert_eq!(report.sha256.len(), 64);

        let listed = engine.list_backups("local").await.unwrap();
        assert_eq!(listed.len(), 1);
        let name = &listed[0].name;
        assert!(name.starts_with("homeserver_backup_"));
        assert!(name.ends_with(".tar.gz.encrypted"));
        assert_eq!(name, &report.artifact_name);
        assert_eq!(remote.names(), vec![name.clone()]);

        // Nothing left behind in the scratch area
        let leftovers = std::fs::read_dir(&fx.settings.temp_dir).unwrap().count();
        assert_eq!(leftovers, 0);

        let out = TempDir::new().unwrap();
        let downloaded = engine.download_backup("local", name, out.path()).await.unwrap();
        let archive_path = out.path().join("restored.tar.gz");
        engine.encryption().decrypt_file(&downloaded, &archive_path).unwrap();
        archive::extract_archive(&archive_path, &out.path().join("extract")).unwrap();
        let content = std::fs::read_to_string(out.path().join("extract").join("a.txt")).unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn test_without_secret_uploads_unencrypted() {
        let fx = fixture();
        let manager = EncryptionManager::from_lookup(&StaticCredentials::new(), &Default::default()).unwrap();
        let engine = BackupEngine::new(fx.settings.clone(), manager)
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)));

        let report = engine.create_backup(&[fx.item.clone()], &[]).await.unwrap();
        assert_eq!(report.status(), RunStatus::Success);
        assert!(!report.encrypted);
        assert!(report.artifact_name.ends_with(".tar.gz"));
        assert!(report.warnings.iter().any(|w| w.contains("unencrypted")));

        let listed = engine.list_backups("local").await.unwrap();
        assert!(!listed[0].name.ends_with(".encrypted"));
    }

    #[tokio::test]
    async fn test_one_failing_provider_is_partial() {
        let fx = fixture();
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)))
            .with_provider(Arc::new(MemoryProvider::failing("broken", u32::MAX)));

        let report = engine.create_backup(&[fx.item.clone()], &[]).await.unwrap();
        assert_eq!(report.status(), RunStatus::Partial);
        assert!(report.results["local"].success);
        assert!(!report.results["broken"].success);
        assert!(report.ensure_success().is_ok());
    }

    #[tokio::test]
    async fn test_all_failing_is_failed() {
        let fx = fixture();
        let broken = Arc::new(MemoryProvider::failing("broken", u32::MAX));
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(broken.clone());

        let report = engine.create_backup(&[fx.item.clone()], &[]).await.unwrap();
        assert_eq!(report.status(), RunStatus::Failed);
        assert!(matches!(report.ensure_success(), Err(Error::AllProvidersFailed)));
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = fixture();
        let flaky = Arc::new(MemoryProvider::failing("flaky", 2));
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(flaky.clone());

        let report = engine.create_backup(&[fx.item.clone()], &[]).await.unwrap();
        assert_eq!(report.status(), RunStatus::Success);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_target_fails_before_io() {
        let fx = fixture();
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)));

        let err = engine.create_backup(&[fx.item.clone()], &["ftp"]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownProvider { .. }));
        assert!(!fx.store.exists());
    }

    #[tokio::test]
    async fn test_no_valid_items() {
        let fx = fixture();
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)));

        let err = engine
            .create_backup(&[PathBuf::from("/nonexistent/homeserver")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBackupItems));
        assert_eq!(std::fs::read_dir(&fx.settings.temp_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_engine_uploads_nothing() {
        let fx = fixture();
        let remote = Arc::new(MemoryProvider::new("remote"));
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(remote.clone());
        engine.cancel();

        let err = engine.create_backup(&[fx.item.clone()], &[]).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(remote.names().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_two_newest() {
        let fx = fixture();
        let remote = Arc::new(MemoryProvider::new("remote"));
        let base = Utc::now() - chrono::Duration::hours(10);
        for i in 1..=5 {
            remote.insert(
                &format!("homeserver_backup_2024010{}_000000.tar.gz", i),
                base + chrono::Duration::hours(i),
            );
        }
        remote.insert("unrelated.txt", base);

        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(remote.clone());
        let report = engine
            .cleanup_old_backups("remote", &RetentionPolicy::keep_last(2))
            .await
            .unwrap();

        assert_eq!(report.examined, 5);
        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(
            remote.names(),
            vec![
                "homeserver_backup_20240104_000000.tar.gz".to_string(),
                "homeserver_backup_20240105_000000.tar.gz".to_string(),
                "unrelated.txt".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_sees_backups_beyond_list_limit() {
        let fx = fixture();
        let remote = Arc::new(MemoryProvider::new("remote"));
        let base = Utc::now() - chrono::Duration::hours(10);
        for i in 1..=5 {
            remote.insert(
                &format!("homeserver_backup_2024010{}_000000.tar.gz", i),
                base + chrono::Duration::hours(i),
            );
        }

        let settings = EngineSettings {
            list_limit: 3,
            ..fx.settings.clone()
        };
        let engine = BackupEngine::new(settings, EncryptionManager::unavailable()).with_provider(remote.clone());

        let listed: Vec<_> = engine
            .list_backups("remote")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(
            listed,
            vec![
                "homeserver_backup_20240103_000000.tar.gz".to_string(),
                "homeserver_backup_20240104_000000.tar.gz".to_string(),
                "homeserver_backup_20240105_000000.tar.gz".to_string(),
            ]
        );

        let report = engine
            .cleanup_old_backups("remote", &RetentionPolicy::keep_last(2))
            .await
            .unwrap();
        assert_eq!(report.examined, 5);
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(
            remote.names(),
            vec![
                "homeserver_backup_20240104_000000.tar.gz".to_string(),
                "homeserver_backup_20240105_000000.tar.gz".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_tests_leave_providers_untouched() {
        let fx = fixture();
        let remote = Arc::new(MemoryProvider::new("remote"));
        remote.insert("homeserver_backup_20240101_000000.tar.gz", Utc::now());
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)))
            .with_provider(remote.clone());

        let results = engine.test_all_providers().await;
        assert!(results["local"]);
        assert!(results["remote"]);
        assert_eq!(remote.names(), vec!["homeserver_backup_20240101_000000.tar.gz".to_string()]);
        let leftovers: Vec<_> = std::fs::read_dir(&fx.store).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_test_all_does_not_short_circuit() {
        let fx = fixture();
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(Arc::new(MemoryProvider::failing("a_broken", u32::MAX)))
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)))
            .with_provider(Arc::new(MemoryProvider::new("remote")));

        let results = engine.test_all_providers().await;
        assert_eq!(results.len(), 3);
        assert!(!results["a_broken"]);
        assert!(results["local"]);
        assert!(results["remote"]);
    }

    #[tokio::test]
    async fn test_scheduled_run_applies_retention() {
        let fx = fixture();
        let remote = Arc::new(MemoryProvider::new("remote"));
        let old = Utc::now() - chrono::Duration::days(90);
        remote.insert("homeserver_backup_20200101_000000.tar.gz", old);

        let settings = EngineSettings {
            retention: RetentionPolicy::new(Some(30), Some(10)),
            ..fx.settings.clone()
        };
        let engine = BackupEngine::new(settings, EncryptionManager::unavailable()).with_provider(remote.clone());

        let run = engine.run_scheduled_backup().await.unwrap();
        assert_eq!(run.backup.status(), RunStatus::Success);
        assert_eq!(run.cleanup["remote"].deleted, vec!["homeserver_backup_20200101_000000.tar.gz"]);
        assert_eq!(remote.names(), vec![run.backup.artifact_name.clone()]);
    }

    #[tokio::test]
    async fn test_list_all_and_status() {
        let fx = fixture();
        let engine = BackupEngine::new(fx.settings.clone(), EncryptionManager::unavailable())
            .with_provider(Arc::new(LocalProvider::new("local", &fx.store)));

        let listings = engine.list_all_backups().await;
        assert!(listings["local"].as_ref().unwrap().is_empty());

        let status = engine.status(&StaticSchedule(ScheduleInfo::inactive()));
        assert!(!status.encryption_available);
        assert_eq!(status.providers, vec!["local".to_string()]);
        assert_eq!(status.backup_items.len(), 1);
        assert!(status.backup_items[0].exists);
    }
}
