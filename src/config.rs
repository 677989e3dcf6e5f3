//! Backup configuration: global settings plus per-provider tunables

use crate::transfer::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default on-disk location of the settings file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/backupTab/settings.json";

/// Environment variable overriding the settings file location
pub const CONFIG_PATH_ENV: &str = "HOMESERVER_BACKUP_CONFIG";

/// Minimum accepted PBKDF2 iteration count
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupConfig {
    pub backup_items: Vec<PathBuf>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub encryption: EncryptionConfig,
    pub compression: CompressionConfig,
    pub retention: RetentionPolicy,
    pub timestamp_format: String,
    pub temp_dir: PathBuf,
    pub max_parallel_uploads: usize,
    pub run_timeout_secs: u64,
    pub list_limit: usize,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Credential service holding the passphrase
    pub credential_service: String,
    pub kdf_iterations: u32,
    pub salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub level: u32,
}

/// How many and how old backups a provider may keep
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Maximum age in days; `None` keeps backups regardless of age
    #[serde(rename = "days")]
    pub max_age_days: Option<u32>,
    /// Maximum number of backups; `None` keeps any number
    #[serde(rename = "max_backups", alias = "max_count")]
    pub max_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<PathBuf>,
    pub level: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "local".to_string(),
            ProviderConfig::from_value(serde_json::json!({
                "enabled": true,
                "container": "/var/www/homeserver/backup",
            })),
        );

        Self {
            backup_items: vec![
                PathBuf::from("/var/www/homeserver/src"),
                PathBuf::from("/var/lib/gogs"),
                PathBuf::from("/etc/homeserver"),
            ],
            providers,
            encryption: EncryptionConfig::default(),
            compression: CompressionConfig::default(),
            retention: RetentionPolicy::default(),
            timestamp_format: "%Y%m%d_%H%M%S".to_string(),
            temp_dir: std::env::temp_dir().join("homeserver-backup"),
            max_parallel_uploads: 4,
            run_timeout_secs: 3600,
            list_limit: 1000,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            credential_service: "backup".to_string(),
            kdf_iterations: MIN_KDF_ITERATIONS,
            salt: "homeserver_backup_salt".to_string(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 9,
        }
    }
}

impl CompressionConfig {
    /// Effective gzip level, clamped to 0..=9; disabled compression stores
    pub fn effective_level(&self) -> u32 {
        if self.enabled {
            self.level.min(9)
        } else {
            0
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: Some(30),
            max_count: Some(10),
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_age_days: Option<u32>, max_count: Option<usize>) -> Self {
        Self {
            max_age_days,
            max_count,
        }
    }

    /// Keep only the newest `max_count` backups
    pub fn keep_last(max_count: usize) -> Self {
        Self::new(None, Some(max_count))
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_age_days.is_none() && self.max_count.is_none()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: Some(PathBuf::from("/var/log/homeserver/backup.log")),
            level: "info".to_string(),
        }
    }
}

impl BackupConfig {
    /// Resolve the settings path from an explicit value, the environment, or
    /// the default location
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Load config from `path`; a missing file yields the defaults and missing
    /// keys are filled from them.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Save config as pretty JSON, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Providers with `enabled: true`, in name order
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&str, &ProviderConfig)> {
        self.providers
            .iter()
            .filter(|(_, config)| config.enabled())
            .map(|(name, config)| (name.as_str(), config))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    /// Check settings, returning warnings for questionable values and an
    /// error for unusable ones
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.timestamp_format.trim().is_empty() {
            return Err(Error::config("timestamp_format must not be empty"));
        }
        if self.list_limit == 0 {
            return Err(Error::config("list_limit must be greater than 0"));
        }
        if self.encryption.enabled && self.encryption.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(Error::config(format!(
                "encryption.kdf_iterations must be at least {}",
                MIN_KDF_ITERATIONS
            )));
        }
        if self.encryption.enabled && self.encryption.salt.is_empty() {
            return Err(Error::config("encryption.salt must not be empty"));
        }

        if self.backup_items.is_empty() {
            warnings.push("No backup items configured".to_string());
        }
        for item in &self.backup_items {
            if !item.is_absolute() {
                warnings.push(format!("Backup item should be an absolute path: {}", item.display()));
            }
        }
        if self.compression.level > 9 {
            warnings.push(format!(
                "Compression level {} out of range, using 9",
                self.compression.level
            ));
        }
        if self.max_parallel_uploads == 0 {
            warnings.push("max_parallel_uploads is 0, uploads will run one at a time".to_string());
        }
        if self.retention.max_count == Some(0) {
            warnings.push("retention.max_backups is 0, cleanup removes every backup".to_string());
        }
        if self.retention.max_age_days == Some(0) {
            warnings.push("retention.days is 0, cleanup removes every backup".to_string());
        }
        if !self.encryption.enabled {
            warnings.push("Encryption is disabled, archives are stored in plaintext".to_string());
        }
        if self.enabled_providers().next().is_none() {
            warnings.push("No providers are enabled".to_string());
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        Ok(warnings)
    }
}

/// Opaque per-provider settings with typed accessors
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ProviderConfig(Map<String, Value>);

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value; non-object values yield an empty config
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Non-empty string value
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or(default).to_string()
    }

    /// Required non-empty string, or a configuration error naming the field
    pub fn require_str(&self, provider: &str, key: &str) -> Result<&str> {
        self.str(key).ok_or_else(|| {
            Error::config(format!("provider '{}' is missing required field '{}'", provider, key))
        })
    }

    /// Unsigned integer; numeric strings are accepted
    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_u64().map(|n| n != 0),
            _ => None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.bool("enabled").unwrap_or(false)
    }

    /// Backend kind: the `type` field, or the provider's configured name
    pub fn kind<'a>(&'a self, name: &'a str) -> &'a str {
        self.str("type").unwrap_or(name)
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings::from_config(self)
    }
}

impl From<Map<String, Value>> for ProviderConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Uniform retry, timeout, and chunking tunables shared by every provider
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    /// Upload limit in bytes per second
    pub max_bandwidth: Option<u64>,
    pub upload_chunk_size: u64,
    pub multipart_threshold: u64,
    pub multipart_concurrency: usize,
    pub connection_pool_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            max_bandwidth: None,
            upload_chunk_size: 100 * 1024 * 1024,
            multipart_threshold: 64 * 1024 * 1024,
            multipart_concurrency: 4,
            connection_pool_size: 5,
        }
    }
}

impl TransferSettings {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: config
                .u64("max_retries")
                .map(|v| v.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_retries),
            retry_delay: config
                .f64("retry_delay")
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.retry_delay),
            timeout: config
                .f64("timeout")
                .filter(|v| v.is_finite() && *v > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.timeout),
            max_bandwidth: config.u64("max_bandwidth").filter(|v| *v > 0),
            upload_chunk_size: config
                .u64("upload_chunk_size")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.upload_chunk_size),
            multipart_threshold: config
                .u64("multipart_threshold")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.multipart_threshold),
            multipart_concurrency: config
                .u64("multipart_concurrency")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(defaults.multipart_concurrency),
            connection_pool_size: config
                .u64("connection_pool_size")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(defaults.connection_pool_size),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BackupConfig::default();
        assert_eq!(config.retention.max_age_days, Some(30));
        assert_eq!(config.retention.max_count, Some(10));
        assert_eq!(config.encryption.kdf_iterations, 100_000);
        assert_eq!(config.compression.effective_level(), 9);
        assert_eq!(config.enabled_providers().count(), 1);
    }

    #[test]
    fn test_partial_file_merges_defaults() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("settings.json");
        fs::write(
            &path,
            r#"{"backup_items": ["/srv/data"], "retention": {"max_backups": 3}}"#,
        )?;

        let config = BackupConfig::load_from(&path)?;
        assert_eq!(config.backup_items, vec![PathBuf::from("/srv/data")]);
        assert_eq!(config.retention.max_count, Some(3));
        assert_eq!(config.retention.max_age_days, Some(30));
        assert_eq!(config.timestamp_format, "%Y%m%d_%H%M%S");
        Ok(())
    }

    #[test]
    fn test_missing_file_yields_defaults() -> Result<()> {
        let temp = TempDir::new()?;
        let config = BackupConfig::load_from(&temp.path().join("absent.json"))?;
        assert_eq!(config, BackupConfig::default());
        Ok(())
    }

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("nested").join("settings.json");

        let mut config = BackupConfig::default();
        config.max_parallel_uploads = 2;
        config.save_to(&path)?;

        assert_eq!(BackupConfig::load_from(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_malformed_file_is_configuration_error() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("settings.json");
        fs::write(&path, "{ not json")?;

        let err = BackupConfig::load_from(&path).unwrap_err();
        assert!(err.is_configuration());
        Ok(())
    }

    #[test]
    fn test_validate_rejects_weak_kdf() {
        let mut config = BackupConfig::default();
        config.encryption.kdf_iterations = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warns() -> Result<()> {
        let mut config = BackupConfig::default();
        config.compression.level = 12;
        config.max_parallel_uploads = 0;

        let warnings = config.validate()?;
        assert_eq!(warnings.len(), 2);
        assert_eq!(config.compression.effective_level(), 9);
        Ok(())
    }

    #[test]
    fn test_provider_accessors() {
        let config = ProviderConfig::from_value(json!({
            "enabled": "true",
            "bucket": "  backups ",
            "max_retries": "5",
            "retry_delay": 0.5,
            "access_key": "",
        }));

        assert!(config.enabled());
        assert_eq!(config.str("bucket"), Some("backups"));
        assert_eq!(config.str("access_key"), None);
        assert_eq!(config.u64("max_retries"), Some(5));
        assert_eq!(config.kind("aws_s3"), "aws_s3");
        assert!(config.require_str("aws_s3", "region").is_err());
    }

    #[test]
    fn test_transfer_settings() {
        let config = ProviderConfig::from_value(json!({
            "max_retries": 5,
            "retry_delay": 0.25,
            "max_bandwidth": 0,
            "multipart_threshold": 1024,
        }));

        let settings = config.transfer_settings();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.retry_delay, Duration::from_millis(250));
        assert_eq!(settings.max_bandwidth, None);
        assert_eq!(settings.multipart_threshold, 1024);
        assert_eq!(settings.timeout, Duration::from_secs(300));
        assert_eq!(settings.retry_policy().max_retries, 5);
    }
}
