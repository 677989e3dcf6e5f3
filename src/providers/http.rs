//! HTTP plumbing shared by the remote backends

use crate::config::TransferSettings;
use crate::transfer::{ErrorClass, ProviderError, TransferOptions};
use crate::{Error, Result};
use reqwest::{Client, Response};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const MAX_ERROR_BODY: usize = 512;

pub(crate) fn build_client(settings: &TransferSettings) -> Result<Client> {
    Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(settings.connection_pool_size)
        .user_agent(concat!("homeserver-backup/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::config(format!("HTTP client error: {}", e)))
}

/// Classify a transport-level failure
pub(crate) fn classify(err: &reqwest::Error) -> ErrorClass {
    if let Some(status) = err.status() {
        return ErrorClass::from_status(status.as_u16());
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

pub(crate) fn send_error(context: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::new(classify(&err), format!("{}: {}", context, err))
}

/// Build an error from a non-success response, classified by status
pub(crate) async fn status_error(context: &str, response: Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ProviderError::new(
        ErrorClass::from_status(status.as_u16()),
        format!("{}: {} {}", context, status, truncate(&body)),
    )
}

pub(crate) fn truncate(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Stream a response body into `<dest>.partial`, renaming onto `dest` once
/// complete. Cancellation is checked between chunks.
pub(crate) async fn download_to_file(
    mut response: Response,
    dest: &Path,
    options: &TransferOptions,
) -> std::result::Result<u64, ProviderError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProviderError::io(format!("create {}", parent.display()), e))?;
    }

    let total = response.content_length().unwrap_or(0);
    let tmp = partial_path(dest);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| ProviderError::io(format!("create {}", tmp.display()), e))?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| send_error("read response body", e))?
        {
            options.check_cancelled("download")?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ProviderError::io(format!("write {}", tmp.display()), e))?;
            written += chunk.len() as u64;
            options.report(written, total.max(written));
        }

        file.flush()
            .await
            .map_err(|e| ProviderError::io(format!("flush {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| ProviderError::io(format!("sync {}", tmp.display()), e))?;

        if total > 0 && written != total {
            return Err(ProviderError::transient(format!(
                "short download: {} of {} bytes",
                written, total
            )));
        }

        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| ProviderError::io(format!("rename onto {}", dest.display()), e))?;
        Ok(written)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(400);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(long.starts_with(cut));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/archive.tar.gz")),
            PathBuf::from("/tmp/archive.tar.gz.partial")
        );
    }
}
