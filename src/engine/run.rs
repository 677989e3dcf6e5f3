//! Per-run scratch directory and wall-clock timeout

use crate::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Scratch directory unique to one run, removed on drop
#[derive(Debug)]
pub(crate) struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create `<base>/run-<pid>-<uuid>`
    pub(crate) fn create(base: &Path) -> Result<Self> {
        let path = base.join(format!(
            "run-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "Created run directory");
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed run directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove run directory: {}", e),
        }
    }
}

/// Cancels `token` once `timeout` elapses; disarmed on drop
#[derive(Debug)]
pub(crate) struct RunTimer {
    handle: Option<JoinHandle<()>>,
}

impl RunTimer {
    pub(crate) fn start(token: CancellationToken, timeout: Option<Duration>) -> Self {
        let handle = timeout.map(|timeout| {
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout_secs = timeout.as_secs(), "Run timed out, cancelling");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });
        Self { handle }
    }
}

impl Drop for RunTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_dir_is_unique_and_removed() {
        let base = TempDir::new().unwrap();
        let first = RunDir::create(base.path()).unwrap();
        let second = RunDir::create(base.path()).unwrap();
        assert_ne!(first.path(), second.path());

        let path = first.path().to_path_buf();
        std::fs::write(path.join("artifact"), b"x").unwrap();
        drop(first);
        assert!(!path.exists());
        assert!(second.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_cancels_token() {
        let token = CancellationToken::new();
        let _timer = RunTimer::start(token.clone(), Some(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_does_not_fire() {
        let token = CancellationToken::new();
        let timer = RunTimer::start(token.clone(), Some(Duration::from_secs(5)));
        drop(timer);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!token.is_cancelled());
    }
}
