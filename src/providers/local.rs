//! Local filesystem provider (NAS mounts, external disks)

use super::{
    bound_listing, finish, list_error, validate_remote_name, Outcome, Provider, ProviderResult,
    RemoteObject,
};
use crate::config::{ProviderConfig, TransferSettings};
use crate::transfer::{run_with_retry, ProviderError, RetryPolicy, TransferOptions};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const KIND: &str = "local";
const DEFAULT_ROOT: &str = "/mnt/nas/backups/homeserver";
const COPY_BUFFER: usize = 1024 * 1024;
const SENTINEL: &str = ".test_connection";

/// Stores artifacts as plain files under a root directory
#[derive(Debug)]
pub struct LocalProvider {
    name: String,
    root: PathBuf,
    retry: RetryPolicy,
}

impl LocalProvider {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Root taken from `container`, falling back to `path`
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let root = config
            .str("container")
            .or_else(|| config.str("path"))
            .unwrap_or(DEFAULT_ROOT);
        let settings = TransferSettings::from_config(config);

        info!(provider = %name, root = %root, "Local provider initialized");
        Ok(Self {
            name: name.to_string(),
            root: PathBuf::from(root),
            retry: settings.retry_policy(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, remote: &str) -> Outcome<PathBuf> {
        validate_remote_name(remote)?;
        Ok(self.root.join(remote))
    }

    async fn copy_upload(
        &self,
        local: &Path,
        dest: &Path,
        options: &TransferOptions,
    ) -> Outcome<u64> {
        let parent = dest.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ProviderError::io(format!("create {}", parent.display()), e))?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.partial-{}", file_name, uuid::Uuid::new_v4()));

        let result = match copy_file(local, &tmp, options).await {
            Ok(n) => fs::rename(&tmp, dest)
                .await
                .map(|_| n)
                .map_err(|e| ProviderError::io(format!("rename onto {}", dest.display()), e)),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }
}

/// Byte copy with progress and cancellation between buffers
async fn copy_file(src: &Path, dst: &Path, options: &TransferOptions) -> Outcome<u64> {
    let mut reader = fs::File::open(src)
        .await
        .map_err(|e| ProviderError::io(format!("open {}", src.display()), e))?;
    let total = reader
        .metadata()
        .await
        .map_err(|e| ProviderError::io(format!("stat {}", src.display()), e))?
        .len();
    let mut writer = fs::File::create(dst)
        .await
        .map_err(|e| ProviderError::io(format!("create {}", dst.display()), e))?;

    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut copied = 0u64;
    loop {
        options.check_cancelled("copy")?;
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| ProviderError::io(format!("read {}", src.display()), e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|e| ProviderError::io(format!("write {}", dst.display()), e))?;
        copied += n as u64;
        options.report(copied, total);
    }

    writer
        .sync_all()
        .await
        .map_err(|e| ProviderError::io(format!("sync {}", dst.display()), e))?;
    Ok(copied)
}

fn is_partial(name: &str) -> bool {
    name.starts_with('.') && name.contains(".partial")
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn upload(&self, local: &Path, remote: &str, options: &TransferOptions) -> ProviderResult {
        let outcome: Outcome<String> = async {
            let dest = self.object_path(remote)?;
            let dest = dest.as_path();
            let bytes = run_with_retry(&self.retry, &options.cancel, "local upload", |_| {
                self.copy_upload(local, dest, options)
            })
            .await?;
            Ok(format!("Stored {} bytes at {}", bytes, dest.display()))
        }
        .await;
        finish(&self.name, "upload", remote, outcome)
    }

    async fn download(&self, remote: &str, local: &Path, options: &TransferOptions) -> ProviderResult {
        let outcome: Outcome<String> = async {
            let source = self.object_path(remote)?;
            if !fs::try_exists(&source).await.unwrap_or(false) {
                return Err(ProviderError::not_found(format!(
                    "{} not found in {}",
                    remote,
                    self.root.display()
                )));
            }

            let source = source.as_path();
            let bytes = run_with_retry(&self.retry, &options.cancel, "local download", |_| async move {
                if let Some(parent) = local.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ProviderError::io(format!("create {}", parent.display()), e))?;
                }
                let tmp = super::http::partial_path(local);
                match copy_file(source, &tmp, options).await {
                    Ok(n) => {
                        fs::rename(&tmp, local)
                            .await
                            .map_err(|e| ProviderError::io(format!("rename onto {}", local.display()), e))?;
                        Ok(n)
                    }
                    Err(e) => {
                        let _ = fs::remove_file(&tmp).await;
                        Err(e)
                    }
                }
            })
            .await?;
            Ok(format!("Downloaded {} bytes to {}", bytes, local.display()))
        }
        .await;
        finish(&self.name, "download", remote, outcome)
    }

    async fn list(&self, prefix: &str, max_results: usize) -> Result<Vec<RemoteObject>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(provider = %self.name, "Root {} does not exist yet", self.root.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(list_error(
                    &self.name,
                    ProviderError::io(format!("list {}", self.root.display()), e),
                ))
            }
        };

        let mut objects = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(list_error(
                        &self.name,
                        ProviderError::io(format!("list {}", self.root.display()), e),
                    ))
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if is_partial(&name) || name == SENTINEL || !name.starts_with(prefix) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            objects.push(RemoteObject::new(name, meta.len(), modified));
        }

        Ok(bound_listing(objects, prefix, max_results))
    }

    async fn delete(&self, remote: &str) -> ProviderResult {
        let outcome: Outcome<String> = async {
            let path = self.object_path(remote)?;
            match fs::remove_file(&path).await {
                Ok(()) => Ok(format!("Deleted {}", path.display())),
                Err(e) => Err(ProviderError::io(format!("delete {}", path.display()), e)),
            }
        }
        .await;
        finish(&self.name, "delete", remote, outcome)
    }

    async fn test_connection(&self) -> bool {
        let sentinel = self.root.join(SENTINEL);
        let result: std::io::Result<bool> = async {
            fs::create_dir_all(&self.root).await?;
            fs::write(&sentinel, b"ok").await?;
            let read_back = fs::read(&sentinel).await?;
            fs::remove_file(&sentinel).await?;
            Ok(read_back == b"ok")
        }
        .await;

        match result {
            Ok(true) => {
                info!(provider = %self.name, "Local storage test successful: {}", self.root.display());
                true
            }
            Ok(false) => {
                warn!(provider = %self.name, "Local storage returned different bytes than written");
                false
            }
            Err(e) => {
                let _ = fs::remove_file(&sentinel).await;
                warn!(provider = %self.name, "Local storage test failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::ErrorClass;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn provider(temp: &TempDir) -> LocalProvider {
        LocalProvider::new("local", temp.path().join("store"))
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let provider = provider(&temp);
        let src = temp.path().join("payload.bin");
        let payload: Vec<u8> = (0..3_000_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&src, &payload)?;

        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        let options = TransferOptions::new().with_progress(Arc::new(move |done, _| {
            sink.store(done, Ordering::SeqCst);
        }));

        let up = provider.upload(&src, "x", &options).await;
        assert!(up.success, "{:?}", up);
        assert_eq!(seen.load(Ordering::SeqCst), payload.len() as u64);

        let dest = temp.path().join("restore").join("x");
        let down = provider.download("x", &dest, &TransferOptions::new()).await;
        assert!(down.success, "{:?}", down);
        assert_eq!(std::fs::read(&dest)?, payload);
        assert!(!super::super::http::partial_path(&dest).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let provider = provider(&temp);
        let result = provider
            .download("absent", &temp.path().join("out"), &TransferOptions::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorClass::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_returns_false() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let provider = provider(&temp);
        let result = provider.delete("never-uploaded").await;
        assert!(!result.success);
        assert!(result.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_prefix_and_limit() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let provider = provider(&temp);
        let root = provider.root().to_path_buf();
        std::fs::create_dir_all(&root)?;
        for name in ["b_2", "a_1", "b_1", "b_3"] {
            std::fs::write(root.join(name), name)?;
        }
        std::fs::write(root.join(".b_4.partial-123"), "partial")?;

        let all = provider.list("", 1000).await?;
        assert_eq!(all.len(), 4);

        let listed = provider.list("b_", 2).await?;
        let names: Vec<_> = listed.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["b_1", "b_2"]);
        assert_eq!(listed[0].size, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_before_first_upload_is_empty() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        assert!(provider(&temp).list("", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_leaves_no_sentinel() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let provider = provider(&temp);
        assert!(provider.test_connection().await);
        assert!(provider.list("", 10).await?.is_empty());
        assert!(!provider.root().join(SENTINEL).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_upload_leaves_no_partial() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let provider = provider(&temp);
        let src = temp.path().join("payload.bin");
        std::fs::write(&src, vec![1u8; 4096])?;

        let options = TransferOptions::new();
        options.cancel.cancel();
        let result = provider.upload(&src, "x", &options).await;
        assert!(result.is_cancelled());
        assert!(provider.list("", 10).await?.is_empty());
        Ok(())
    }

    #[test]
    fn test_root_from_config() -> anyhow::Result<()> {
        let config = ProviderConfig::from_value(json!({"enabled": true, "path": "/srv/backups"}));
        let provider = LocalProvider::from_config("nas", &config)?;
        assert_eq!(provider.root(), Path::new("/srv/backups"));
        assert_eq!(provider.name(), "nas");
        Ok(())
    }
}
