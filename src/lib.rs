//! # homeserver_backup
//!
//! Encrypted archive backups for a homeserver, shipped to pluggable storage
//! providers with retention cleanup.
//!
//! ## Features
//!
//! - **Archive**: tar.gz of the configured paths with embedded metadata
//! - **Encryption**: PBKDF2-derived key, XChaCha20-Poly1305 streaming frames
//! - **Providers**: local filesystem, S3 and compatibles, Backblaze B2,
//!   Dropbox, Google Drive
//! - **Transfers**: retries with backoff, bandwidth throttling, cancellation
//! - **Retention**: age and count limits applied per provider
//! - **Restore**: download, decrypt, and extract in one step
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use homeserver_backup::{BackupEngine, EncryptionManager, EngineSettings, LocalProvider};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let engine = BackupEngine::new(EngineSettings::default(), EncryptionManager::unavailable())
//!     .with_provider(Arc::new(LocalProvider::new("local", "/mnt/backups")));
//!
//! let report = engine.create_backup(&[PathBuf::from("/etc/homeserver")], &[]).await?;
//! println!("Backup {}: {}", report.status(), report.artifact_name);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod logging;
pub mod providers;
pub mod restore;
pub mod schedule;
pub mod transfer;

// Re-export commonly used types
pub use config::{BackupConfig, ProviderConfig, RetentionPolicy};
pub use credentials::{CredentialLookup, ServiceCredentials};
pub use crypto::EncryptionManager;
pub use engine::{BackupEngine, BackupReport, EngineSettings, RunStatus};
pub use error::{Error, Result};
pub use providers::{LocalProvider, Provider, ProviderRegistry, ProviderResult, RemoteObject};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
