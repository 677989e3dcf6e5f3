//! Storage provider contract and backend implementations
//!
//! Every backend is a [`Provider`]. The engine and the tests only talk to
//! this trait, so local disk and each object-storage service are
//! interchangeable. Backends classify their own failures into
//! [`ErrorClass`]; only a [`ProviderResult`] crosses back to the caller.

use crate::transfer::{ErrorClass, ProviderError, TransferOptions};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info, warn};

pub mod backblaze;
pub mod dropbox;
pub mod google_drive;
mod http;
pub mod local;
pub mod registry;
pub mod s3;
mod sigv4;
#[cfg(test)]
mod stub_http;

pub use backblaze::BackblazeProvider;
pub use dropbox::DropboxProvider;
pub use google_drive::GoogleDriveProvider;
pub use local::LocalProvider;
pub use registry::{ProviderConstructor, ProviderRegistry, ProviderStatus};
pub use s3::S3Provider;

/// An object reported by a provider's `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
    /// Backend identifier when it differs from the name
    pub id: Option<String>,
}

impl RemoteObject {
    pub fn new(name: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            modified,
            etag: None,
            storage_class: None,
            id: None,
        }
    }
}

/// Outcome of one provider operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub provider: String,
    pub success: bool,
    pub error: Option<ErrorClass>,
    pub message: Option<String>,
}

impl ProviderResult {
    pub fn ok(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            success: true,
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn failed(provider: &str, err: &ProviderError) -> Self {
        Self {
            provider: provider.to_string(),
            success: false,
            error: Some(err.class),
            message: Some(err.message.clone()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.error == Some(ErrorClass::NotFound)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == Some(ErrorClass::Cancelled)
    }
}

/// Uniform storage backend contract
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configured instance name (the key in the providers map)
    fn name(&self) -> &str;

    /// Backend kind, e.g. `local` or `aws_s3`
    fn kind(&self) -> &'static str;

    /// Copy `local` to `remote`, creating the remote container if needed
    async fn upload(&self, local: &Path, remote: &str, options: &TransferOptions) -> ProviderResult;

    /// Fetch `remote` into `local`; a missing object is a not-found result
    async fn download(&self, remote: &str, local: &Path, options: &TransferOptions) -> ProviderResult;

    /// At most `max_results` objects whose names start with `prefix`
    async fn list(&self, prefix: &str, max_results: usize) -> Result<Vec<RemoteObject>>;

    /// Delete `remote`; a missing object is a not-found result, never an error
    async fn delete(&self, remote: &str) -> ProviderResult;

    /// Cheapest call proving access, without observable remote mutation
    async fn test_connection(&self) -> bool;

    async fn get_file_info(&self, remote: &str) -> Option<RemoteObject> {
        match self.list(remote, 1000).await {
            Ok(objects) => objects.into_iter().find(|o| o.name == remote),
            Err(e) => {
                warn!(provider = %self.name(), "Failed to look up {}: {}", remote, e);
                None
            }
        }
    }

    async fn exists(&self, remote: &str) -> bool {
        self.get_file_info(remote).await.is_some()
    }

    async fn get_size(&self, remote: &str) -> Option<u64> {
        self.get_file_info(remote).await.map(|o| o.size)
    }
}

pub(crate) type Outcome<T> = std::result::Result<T, ProviderError>;

/// Log and convert an operation outcome into a [`ProviderResult`]
pub(crate) fn finish(
    provider: &str,
    operation: &str,
    target: &str,
    outcome: Outcome<String>,
) -> ProviderResult {
    match outcome {
        Ok(message) => {
            info!(provider, operation, target, "{}", message);
            ProviderResult::ok(provider, message)
        }
        Err(err) => {
            match err.class {
                ErrorClass::NotFound => {
                    warn!(provider, operation, target, "Not found: {}", err.message)
                }
                ErrorClass::Cancelled => {
                    warn!(provider, operation, target, "Cancelled: {}", err.message)
                }
                _ => error!(
                    provider,
                    operation,
                    target,
                    class = %err.class,
                    "Operation failed: {}",
                    err.message
                ),
            }
            ProviderResult::failed(provider, &err)
        }
    }
}

/// Convert a classified list failure into the crate error
pub(crate) fn list_error(provider: &str, err: ProviderError) -> Error {
    Error::Provider {
        provider: provider.to_string(),
        class: err.class,
        message: err.message,
    }
}

/// Filter, sort by name, and bound a listing
pub(crate) fn bound_listing(mut objects: Vec<RemoteObject>, prefix: &str, max_results: usize) -> Vec<RemoteObject> {
    objects.retain(|o| o.name.starts_with(prefix));
    objects.sort_by(|a, b| a.name.cmp(&b.name));
    objects.truncate(max_results);
    objects
}

/// Reject remote names that would escape the provider's container
pub(crate) fn validate_remote_name(name: &str) -> Outcome<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        Err(ProviderError::permanent(format!("invalid remote name '{}'", name)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_name_validation() {
        assert!(validate_remote_name("homeserver_backup_20240101_000000.tar.gz").is_ok());
        assert!(validate_remote_name("nested/file").is_ok());
        assert!(validate_remote_name("").is_err());
        assert!(validate_remote_name("../escape").is_err());
        assert!(validate_remote_name("/abs").is_err());
        assert!(validate_remote_name("a//b").is_err());
    }

    #[test]
    fn test_bound_listing() {
        let now = Utc::now();
        let objects = vec![
            RemoteObject::new("b", 1, now),
            RemoteObject::new("a", 1, now),
            RemoteObject::new("x", 1, now),
            RemoteObject::new("c", 1, now),
        ];
        let listed = bound_listing(objects, "", 2);
        let names: Vec<_> = listed.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_result_from_error() {
        let result = finish("s3", "delete", "x", Err(ProviderError::not_found("gone")));
        assert!(!result.success);
        assert!(result.is_not_found());
        assert_eq!(result.message.as_deref(), Some("gone"));
    }
}
