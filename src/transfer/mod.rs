//! Transfer primitives: retry state machine, throttling, progress reporting

mod retry;
mod throttle;

pub use retry::{run_with_retry, ErrorClass, ProviderError, RetryPolicy, TransferState};
pub use throttle::BandwidthThrottle;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

/// Progress callback invoked with `(bytes_done, bytes_total)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Per-call transfer options handed to providers
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report progress, if a callback is attached
    pub fn report(&self, done: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(done, total);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with a cancelled error when cancellation was requested
    pub fn check_cancelled(&self, what: &str) -> Result<(), ProviderError> {
        if self.cancel.is_cancelled() {
            Err(ProviderError::cancelled(format!("{} cancelled", what)))
        } else {
            Ok(())
        }
    }
}

/// Read `len` bytes starting at `offset`; used for chunked uploads
pub async fn read_file_range(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, ProviderError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ProviderError::io(format!("open {}", path.display()), e))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| ProviderError::io(format!("seek {}", path.display()), e))?;

    let mut buf = Vec::with_capacity(len);
    (&mut file)
        .take(len as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ProviderError::io(format!("read {}", path.display()), e))?;
    Ok(buf)
}

/// Size of a local file, classified as a provider error on failure
pub async fn local_file_size(path: &Path) -> Result<u64, ProviderError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ProviderError::io(format!("stat {}", path.display()), e))?;
    Ok(meta.len())
}
