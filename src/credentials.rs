//! Credential lookup for encryption passphrases and backend API keys
//!
//! Lookups never fail: a service that is not configured resolves to `None`
//! and the caller decides whether that is fatal.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default directory holding exported `<service>.key` files
pub const DEFAULT_VAULT_DIR: &str = "/vault/.keys";

/// Username/password pair for a named service, plus any extra fields
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ServiceCredentials {
    pub username: String,
    pub password: String,
    pub extra: HashMap<String, String>,
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            extra: HashMap::new(),
        }
    }

    /// Parse `key=value` lines; `username` and `password` are mandatory
    pub fn parse(content: &str) -> Option<Self> {
        let mut fields: HashMap<String, String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();

        let username = fields.remove("username")?;
        let password = fields.remove("password")?;
        Some(Self {
            username,
            password,
            extra: fields,
        })
    }
}

/// Source of service credentials
pub trait CredentialLookup: Send + Sync {
    fn get_credentials(&self, service: &str) -> Option<ServiceCredentials>;

    /// The secret (password) for `service`; empty secrets count as absent
    fn get_secret(&self, service: &str) -> Option<String> {
        self.get_credentials(service)
            .map(|creds| creds.password)
            .filter(|secret| !secret.is_empty())
    }
}

impl<T: CredentialLookup + ?Sized> CredentialLookup for Arc<T> {
    fn get_credentials(&self, service: &str) -> Option<ServiceCredentials> {
        (**self).get_credentials(service)
    }

    fn get_secret(&self, service: &str) -> Option<String> {
        (**self).get_secret(service)
    }
}

/// Reads `<dir>/<service>.key` files in `key=value` form
#[derive(Debug, Clone)]
pub struct KeyFileVault {
    dir: PathBuf,
}

impl KeyFileVault {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, service: &str) -> Option<PathBuf> {
        let valid = !service.is_empty()
            && service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !service.starts_with('.');
        valid.then(|| self.dir.join(format!("{}.key", service)))
    }

    /// Whether a key file exists for `service`
    pub fn service_configured(&self, service: &str) -> bool {
        self.key_path(service).map(|p| p.is_file()).unwrap_or(false)
    }
}

impl Default for KeyFileVault {
    fn default() -> Self {
        Self::new(DEFAULT_VAULT_DIR)
    }
}

impl CredentialLookup for KeyFileVault {
    fn get_credentials(&self, service: &str) -> Option<ServiceCredentials> {
        let Some(path) = self.key_path(service) else {
            warn!(service, "Rejected credential service name");
            return None;
        };

        match fs::read_to_string(&path) {
            Ok(content) => {
                let creds = ServiceCredentials::parse(&content);
                if creds.is_none() {
                    warn!(service, "Key file {} lacks username/password", path.display());
                }
                creds
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(service, "Service not configured (no key file)");
                None
            }
            Err(e) => {
                warn!(service, "Failed to read key file {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Reads `HOMESERVER_<SERVICE>_USERNAME` / `HOMESERVER_<SERVICE>_PASSWORD`
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn new() -> Self {
        Self
    }

    pub fn variable(service: &str, field: &str) -> String {
        let service: String = service
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("HOMESERVER_{}_{}", service, field)
    }
}

impl CredentialLookup for EnvCredentials {
    fn get_credentials(&self, service: &str) -> Option<ServiceCredentials> {
        let password = std::env::var(Self::variable(service, "PASSWORD")).ok()?;
        let username = std::env::var(Self::variable(service, "USERNAME")).unwrap_or_default();
        Some(ServiceCredentials::new(username, password))
    }
}

/// In-memory credentials, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, ServiceCredentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: &str, credentials: ServiceCredentials) -> Self {
        self.entries.insert(service.to_string(), credentials);
        self
    }

    /// Shorthand for a service that only carries a secret
    pub fn with_secret(self, service: &str, secret: &str) -> Self {
        self.with(service, ServiceCredentials::new("", secret))
    }
}

impl CredentialLookup for StaticCredentials {
    fn get_credentials(&self, service: &str) -> Option<ServiceCredentials> {
        self.entries.get(service).cloned()
    }
}

/// Tries each lookup in order, returning the first hit
#[derive(Default)]
pub struct ChainedCredentials {
    sources: Vec<Box<dyn CredentialLookup>>,
}

impl ChainedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, source: impl CredentialLookup + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// The standard chain: key-file vault, then environment
    pub fn system() -> Self {
        Self::new().push(KeyFileVault::default()).push(EnvCredentials::new())
    }
}

impl CredentialLookup for ChainedCredentials {
    fn get_credentials(&self, service: &str) -> Option<ServiceCredentials> {
        self.sources.iter().find_map(|s| s.get_credentials(service))
    }

    fn get_secret(&self, service: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.get_secret(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_key_file() {
        let creds = ServiceCredentials::parse(
            "username=backup-user\npassword = s3cr=t \n# comment\nregion=eu-west-1\n",
        )
        .unwrap();
        assert_eq!(creds.username, "backup-user");
        assert_eq!(creds.password, "s3cr=t");
        assert_eq!(creds.extra.get("region").map(String::as_str), Some("eu-west-1"));

        assert!(ServiceCredentials::parse("username=only").is_none());
    }

    #[test]
    fn test_vault_lookup() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        fs::write(temp.path().join("backup.key"), "username=root\npassword=hunter2\n")?;
        let vault = KeyFileVault::new(temp.path());

        assert!(vault.service_configured("backup"));
        assert_eq!(vault.get_secret("backup").as_deref(), Some("hunter2"));
        assert!(vault.get_credentials("dropbox").is_none());
        assert!(vault.get_credentials("../backup").is_none());
        Ok(())
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = ServiceCredentials::new("user", "topsecret");
        assert!(!format!("{:?}", creds).contains("topsecret"));
    }

    #[test]
    fn test_empty_secret_is_absent() {
        let lookup = StaticCredentials::new().with_secret("backup", "");
        assert!(lookup.get_credentials("backup").is_some());
        assert!(lookup.get_secret("backup").is_none());
    }

    #[test]
    fn test_chain_order() {
        let chain = ChainedCredentials::new()
            .push(StaticCredentials::new().with_secret("a", "first"))
            .push(
                StaticCredentials::new()
                    .with_secret("a", "second")
                    .with_secret("b", "other"),
            );

        assert_eq!(chain.get_secret("a").as_deref(), Some("first"));
        assert_eq!(chain.get_secret("b").as_deref(), Some("other"));
        assert!(chain.get_secret("c").is_none());
    }

    #[test]
    fn test_env_variable_name() {
        assert_eq!(
            EnvCredentials::variable("aws_s3", "PASSWORD"),
            "HOMESERVER_AWS_S3_PASSWORD"
        );
    }
}
