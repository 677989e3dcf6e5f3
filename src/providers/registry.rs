//! Provider registry: backend kind → constructor
//!
//! Backends that cannot be built in this binary are registered as
//! unavailable and fail with [`Error::NotSupported`] instead of degrading
//! silently.

use super::{backblaze, dropbox, google_drive, local, s3, Provider};
use super::{BackblazeProvider, DropboxProvider, GoogleDriveProvider, LocalProvider, S3Provider};
use crate::config::ProviderConfig;
use crate::credentials::{CredentialLookup, ServiceCredentials};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds a configured provider from its instance name and settings
pub type ProviderConstructor = fn(&str, &ProviderConfig) -> Result<Arc<dyn Provider>>;

#[derive(Clone)]
enum Entry {
    Available(ProviderConstructor),
    Unavailable(String),
}

/// What the registry knows about one configured provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: String,
    pub available: bool,
    pub enabled: bool,
    pub keyman_integrated: bool,
    pub credentials_available: bool,
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, Entry>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend this crate ships
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(local::KIND, build_local);
        registry.register(s3::KIND, build_s3);
        registry.register(backblaze::KIND, build_backblaze);
        registry.register(dropbox::KIND, build_dropbox);
        registry.register(google_drive::KIND, build_google_drive);
        registry.register_unavailable(
            "google_cloud_storage",
            "Google Cloud Storage is not built into this release",
        );
        registry
    }

    pub fn register(&mut self, kind: &str, constructor: ProviderConstructor) {
        debug!(kind, "Registered provider");
        self.entries.insert(kind.to_string(), Entry::Available(constructor));
    }

    pub fn register_unavailable(&mut self, kind: &str, reason: impl Into<String>) {
        self.entries
            .insert(kind.to_string(), Entry::Unavailable(reason.into()));
    }

    /// Kinds that can actually be constructed
    pub fn available(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Available(_)))
            .map(|(kind, _)| kind.as_str())
            .collect()
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// Build the provider `name`, resolving vault credentials first.
    ///
    /// The backend kind is the config's `type` field or, failing that, the
    /// name itself.
    pub fn create(
        &self,
        name: &str,
        config: &ProviderConfig,
        credentials: &dyn CredentialLookup,
    ) -> Result<Arc<dyn Provider>> {
        let kind = config.kind(name);
        let constructor = match self.entries.get(kind) {
            Some(Entry::Available(constructor)) => *constructor,
            Some(Entry::Unavailable(reason)) => {
                return Err(Error::NotSupported {
                    provider: name.to_string(),
                    reason: reason.clone(),
                })
            }
            None => {
                return Err(Error::UnknownProvider {
                    name: kind.to_string(),
                })
            }
        };

        let resolved = resolve_credentials(name, kind, config, credentials);
        let provider = constructor(name, &resolved)?;
        info!(
            provider = %name,
            kind,
            keyman_integrated = keyman_integrated(config),
            "Created provider"
        );
        Ok(provider)
    }

    pub fn status(&self, name: &str, config: &ProviderConfig, credentials: &dyn CredentialLookup) -> ProviderStatus {
        let kind = config.kind(name);
        let integrated = keyman_integrated(config);
        let credentials_available = if integrated {
            credentials.get_credentials(service_name(name, config)).is_some()
                || fallback(kind, config).is_some()
        } else {
            let (user_field, secret_field) = credential_fields(kind);
            config.contains(user_field) || config.contains(secret_field) || kind == local::KIND
        };

        ProviderStatus {
            name: name.to_string(),
            kind: kind.to_string(),
            available: matches!(self.entries.get(kind), Some(Entry::Available(_))),
            enabled: config.enabled(),
            keyman_integrated: integrated,
            credentials_available,
        }
    }
}

fn build_local(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(LocalProvider::from_config(name, config)?))
}

fn build_s3(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(S3Provider::from_config(name, config)?))
}

fn build_backblaze(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(BackblazeProvider::from_config(name, config)?))
}

fn build_dropbox(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(DropboxProvider::from_config(name, config)?))
}

fn build_google_drive(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(GoogleDriveProvider::from_config(name, config)?))
}

fn keyman_integrated(config: &ProviderConfig) -> bool {
    config.bool("keyman_integrated").unwrap_or(false)
}

fn service_name<'a>(name: &'a str, config: &'a ProviderConfig) -> &'a str {
    config.str("keyman_service_name").unwrap_or(name)
}

/// Config fields a vault `username`/`password` pair fills for each kind
fn credential_fields(kind: &str) -> (&'static str, &'static str) {
    match kind {
        "backblaze" => ("application_key_id", "application_key"),
        "aws_s3" => ("access_key", "secret_key"),
        "google_cloud_storage" => ("service_account_key", "project_id"),
        "dropbox" => ("app_key", "access_token"),
        "google_drive" => ("client_id", "refresh_token"),
        _ => ("username", "password"),
    }
}

/// `fallback_credentials` as a username/password pair
fn fallback(kind: &str, config: &ProviderConfig) -> Option<ServiceCredentials> {
    let fallback = config.get("fallback_credentials")?.as_object()?;
    let kind_fields = credential_fields(kind);
    let pick = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|k| fallback.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    };
    let username = pick([kind_fields.0, "username"]);
    let password = pick([kind_fields.1, "password"]);
    if username.is_empty() && password.is_empty() {
        return None;
    }
    Some(ServiceCredentials::new(username, password))
}

/// Copy of `config` with vault credentials merged in when
/// `keyman_integrated` is set
fn resolve_credentials(
    name: &str,
    kind: &str,
    config: &ProviderConfig,
    lookup: &dyn CredentialLookup,
) -> ProviderConfig {
    if !keyman_integrated(config) {
        return config.clone();
    }

    let service = service_name(name, config);
    let found = lookup.get_credentials(service).or_else(|| {
        warn!(provider = %name, service, "No vault credentials found, using fallback");
        fallback(kind, config)
    });
    let Some(found) = found else {
        warn!(provider = %name, service, "No credentials available");
        return config.clone();
    };

    let (user_field, secret_field) = credential_fields(kind);
    let mut resolved = config.clone();
    if !found.username.is_empty() {
        resolved.set(user_field, found.username.clone());
    }
    if !found.password.is_empty() {
        resolved.set(secret_field, found.password.clone());
    }
    for (key, value) in &found.extra {
        resolved.set(key, value.clone());
    }
    resolved
}
