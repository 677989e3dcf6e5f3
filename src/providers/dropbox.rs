//! Dropbox provider (API v2)
//!
//! Files live under a single folder, `/HOMESERVER Backups` by default. Large
//! files go through an upload session that only becomes a file on `finish`,
//! so an interrupted transfer leaves nothing visible in the folder.

use super::http::{build_client, download_to_file, send_error, truncate};
use super::{
    bound_listing, finish, list_error, validate_remote_name, Outcome, Provider, ProviderResult,
    RemoteObject,
};
use crate::config::{ProviderConfig, TransferSettings};
use crate::transfer::{
    local_file_size, read_file_range, run_with_retry, BandwidthThrottle, ErrorClass, ProviderError,
    RetryPolicy, TransferOptions,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const KIND: &str = "dropbox";

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";
const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const DEFAULT_FOLDER: &str = "/HOMESERVER Backups";
/// Largest body a single upload or append call accepts
const MAX_CHUNK: u64 = 148 * 1024 * 1024;
const MIN_CHUNK: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
struct RefreshConfig {
    refresh_token: String,
    app_key: String,
    app_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ListFolder {
    entries: Vec<Entry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    id: Option<String>,
    #[serde(default)]
    size: u64,
    server_modified: Option<DateTime<Utc>>,
    content_hash: Option<String>,
}

/// Error body of an API endpoint. `error` is a tagged union whose
/// `.tag` names the variant and whose payload sits under that tag.
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
    #[serde(default)]
    error: Value,
}

impl ApiError {
    fn from_body(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    /// Variant tags from the outermost union inward, e.g. `path`, `conflict`, `folder`
    fn tags(&self) -> Vec<&str> {
        let mut tags = Vec::new();
        let mut node = &self.error;
        while let Some(tag) = node.get(".tag").and_then(Value::as_str) {
            tags.push(tag);
            match node.get(tag).or_else(|| node.get("reason")) {
                Some(inner) => node = inner,
                None => break,
            }
        }
        tags
    }

    /// A folder already sits at the requested path
    fn is_folder_conflict(&self) -> bool {
        matches!(self.tags().as_slice(), ["path", "conflict", rest @ ..] if rest.first() != Some(&"file"))
    }
}

pub struct DropboxProvider {
    name: String,
    folder: String,
    access_token: RwLock<Option<String>>,
    refresh: Option<RefreshConfig>,
    settings: TransferSettings,
    client: Client,
    throttle: BandwidthThrottle,
}

impl std::fmt::Debug for DropboxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropboxProvider")
            .field("name", &self.name)
            .field("folder", &self.folder)
            .field("refreshable", &self.refresh.is_some())
            .finish_non_exhaustive()
    }
}

impl DropboxProvider {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let access_token = config.str("access_token").map(String::from);
        let refresh = match (
            config.str("refresh_token"),
            config.str("app_key"),
            config.str("app_secret"),
        ) {
            (Some(refresh_token), Some(app_key), Some(app_secret)) => Some(RefreshConfig {
                refresh_token: refresh_token.to_string(),
                app_key: app_key.to_string(),
                app_secret: app_secret.to_string(),
            }),
            _ => None,
        };
        if access_token.is_none() && refresh.is_none() {
            return Err(Error::config(format!(
                "provider '{}' needs access_token or refresh_token with app_key and app_secret",
                name
            )));
        }

        let folder = normalize_folder(config.str("folder_path").unwrap_or(DEFAULT_FOLDER));
        let settings = TransferSettings::from_config(config);
        let client = build_client(&settings)?;

        info!(provider = %name, folder = %folder, "Dropbox provider initialized");
        Ok(Self {
            name: name.to_string(),
            folder,
            access_token: RwLock::new(access_token),
            refresh,
            throttle: BandwidthThrottle::new(settings.max_bandwidth),
            settings,
            client,
        })
    }

    fn retry(&self) -> RetryPolicy {
        self.settings.retry_policy()
    }

    fn remote_path(&self, remote: &str) -> String {
        format!("{}/{}", self.folder, remote)
    }

    fn chunk_size(&self) -> u64 {
        self.settings.upload_chunk_size.clamp(MIN_CHUNK, MAX_CHUNK)
    }

    async fn token(&self) -> Outcome<String> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }

        let refresh = self
            .refresh
            .as_ref()
            .ok_or_else(|| ProviderError::permanent("Dropbox access token rejected and no refresh token configured"))?;

        let response = self
            .client
            .post(TOKEN_URL)
            .basic_auth(&refresh.app_key, Some(&refresh.app_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| send_error("Dropbox token refresh", e))?;
        if !response.status().is_success() {
            let mut err = dropbox_error("Dropbox token refresh", response).await;
            err.class = match err.class {
                ErrorClass::Transient => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            };
            return Err(err);
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("Dropbox token refresh: {}", e)))?;

        debug!(provider = %self.name, "Refreshed Dropbox access token");
        *self.access_token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    /// Send with the bearer token; an expired token is dropped so the next
    /// attempt refreshes it
    async fn send(&self, context: &str, build: impl FnOnce(&Client) -> RequestBuilder) -> Outcome<Response> {
        let token = self.token().await?;
        let response = build(&self.client)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| send_error(context, e))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let mut err = dropbox_error(context, response).await;
            if self.refresh.is_some() {
                *self.access_token.write().await = None;
                err.class = ErrorClass::Transient;
            }
            return Err(err);
        }
        Ok(response)
    }

    async fn rpc<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> Outcome<T> {
        let url = format!("{}/{}", API_URL, endpoint);
        let response = self
            .send(endpoint, |client| client.post(url).json(&body))
            .await?;
        parse(response, endpoint).await
    }

    async fn content_upload<T: DeserializeOwned>(&self, endpoint: &str, arg: Value, body: Vec<u8>) -> Outcome<T> {
        let url = format!("{}/{}", CONTENT_URL, endpoint);
        let arg = api_arg(&arg);
        self.throttle.consume(body.len() as u64).await;
        let response = self
            .send(endpoint, |client| {
                client
                    .post(url)
                    .header("Dropbox-API-Arg", arg)
                    .header("Content-Type", "application/octet-stream")
                    .body(body)
            })
            .await?;
        parse(response, endpoint).await
    }

    async fn ensure_folder(&self, options: &TransferOptions) -> Outcome<()> {
        const ENDPOINT: &str = "files/create_folder_v2";
        let url = format!("{}/{}", API_URL, ENDPOINT);
        let url = url.as_str();
        let body = json!({"path": self.folder, "autorename": false});
        let body = &body;

        run_with_retry(&self.retry(), &options.cancel, "Dropbox create folder", |_| async move {
            let response = self
                .send(ENDPOINT, |client| client.post(url).json(body))
                .await?;
            if response.status() == StatusCode::CONFLICT {
                let text = response.text().await.unwrap_or_default();
                if ApiError::from_body(&text).is_some_and(|e| e.is_folder_conflict()) {
                    return Ok(());
                }
                return Err(classify_dropbox(StatusCode::CONFLICT, &text, ENDPOINT));
            }
            let _: Value = parse(response, ENDPOINT).await?;
            info!(provider = %self.name, folder = %self.folder, "Created folder");
            Ok(())
        })
        .await
    }

    async fn upload_single(&self, local: &Path, path: &str, size: u64, options: &TransferOptions) -> Outcome<()> {
        run_with_retry(&self.retry(), &options.cancel, "Dropbox upload", |_| async move {
            let body = tokio::fs::read(local)
                .await
                .map_err(|e| ProviderError::io(format!("read {}", local.display()), e))?;
            let _: Value = self
                .content_upload("files/upload", commit_info(path), body)
                .await?;
            Ok(())
        })
        .await?;
        options.report(size, size);
        Ok(())
    }

    /// Chunks are appended in order; the file appears only when the session
    /// is finished
    async fn upload_session(&self, local: &Path, path: &str, size: u64, options: &TransferOptions) -> Outcome<()> {
        let chunk = self.chunk_size();
        let session: SessionStart = run_with_retry(&self.retry(), &options.cancel, "Dropbox session start", |_| async move {
            self.content_upload("files/upload_session/start", json!({"close": false}), Vec::new())
                .await
        })
        .await?;
        let session_id = session.session_id.as_str();
        debug!(provider = %self.name, session_id, "Upload session started");

        let mut offset = 0u64;
        while offset < size {
            options.check_cancelled("Dropbox upload session")?;
            let len = chunk.min(size - offset);
            run_with_retry(&self.retry(), &options.cancel, "Dropbox session append", |_| async move {
                let body = read_file_range(local, offset, len as usize).await?;
                let arg = json!({"cursor": {"session_id": session_id, "offset": offset}, "close": false});
                let _: Value = self
                    .content_upload("files/upload_session/append_v2", arg, body)
                    .await?;
                Ok(())
            })
            .await?;
            offset += len;
            options.report(offset, size);
        }

        options.check_cancelled("Dropbox upload session")?;
        run_with_retry(&self.retry(), &options.cancel, "Dropbox session finish", |_| async move {
            let arg = json!({
                "cursor": {"session_id": session_id, "offset": size},
                "commit": commit_info(path),
            });
            let _: Value = self
                .content_upload("files/upload_session/finish", arg, Vec::new())
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_folder(&self, cancel: &CancellationToken, cursor: Option<&str>) -> Outcome<ListFolder> {
        run_with_retry(&self.retry(), cancel, "Dropbox list folder", |_| async move {
            match cursor {
                Some(cursor) => self.rpc("files/list_folder/continue", json!({"cursor": cursor})).await,
                None => {
                    self.rpc(
                        "files/list_folder",
                        json!({"path": self.folder, "recursive": false, "limit": 2000}),
                    )
                    .await
                }
            }
        })
        .await
    }
}

fn normalize_folder(folder: &str) -> String {
    let trimmed = folder.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn commit_info(path: &str) -> Value {
    json!({"path": path, "mode": "overwrite", "autorename": false, "mute": true})
}

/// `Dropbox-API-Arg` must be ASCII; everything else is `\u` escaped
fn api_arg(value: &Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

async fn parse<T: DeserializeOwned>(response: Response, context: &str) -> Outcome<T> {
    if !response.status().is_success() {
        return Err(dropbox_error(context, response).await);
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::transient(format!("{}: unexpected response: {}", context, e)))
}

async fn dropbox_error(context: &str, response: Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_dropbox(status, &body, context)
}

/// Endpoint errors arrive as 409 with a tagged `error` union
fn classify_dropbox(status: StatusCode, body: &str, context: &str) -> ProviderError {
    let parsed = ApiError::from_body(body);
    let tags = parsed.as_ref().map(ApiError::tags).unwrap_or_default();

    let class = if status != StatusCode::CONFLICT {
        ErrorClass::from_status(status.as_u16())
    } else if tags.contains(&"not_found") {
        ErrorClass::NotFound
    } else if tags.contains(&"too_many_write_operations") {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    };
    let detail = match &parsed {
        Some(e) if !e.error_summary.is_empty() => e.error_summary.clone(),
        _ => truncate(body).to_string(),
    };
    ProviderError::new(class, format!("{}: {} {}", context, status, detail))
}

fn to_remote(entry: Entry) -> Option<RemoteObject> {
    if entry.tag != "file" {
        return None;
    }
    Some(RemoteObject {
        name: entry.name,
        size: entry.size,
        modified: entry.server_modified.unwrap_or_else(Utc::now),
        etag: entry.content_hash,
        storage_class: None,
        id: entry.id,
    })
}

#[async_trait]
impl Provider for DropboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn upload(&self, local: &Path, remote: &str, options: &TransferOptions) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let size = local_file_size(local).await?;
            self.ensure_folder(options).await?;

            let path = self.remote_path(remote);
            if size >= self.settings.multipart_threshold || size > MAX_CHUNK {
                self.upload_session(local, &path, size, options).await?;
            } else {
                self.upload_single(local, &path, size, options).await?;
            }
            Ok(format!("Uploaded {} bytes to dropbox:{}", size, path))
        }
        .await;
        finish(&self.name, "upload", remote, outcome)
    }

    async fn download(&self, remote: &str, local: &Path, options: &TransferOptions) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let path = self.remote_path(remote);
            let arg = api_arg(&json!({"path": path}));
            let arg = arg.as_str();

            let bytes = run_with_retry(&self.retry(), &options.cancel, "Dropbox download", |_| async move {
                let url = format!("{}/files/download", CONTENT_URL);
                let response = self
                    .send("files/download", |client| client.post(url).header("Dropbox-API-Arg", arg))
                    .await?;
                if !response.status().is_success() {
                    return Err(dropbox_error("Dropbox download", response).await);
                }
                download_to_file(response, local, options).await
            })
            .await?;
            Ok(format!("Downloaded {} bytes to {}", bytes, local.display()))
        }
        .await;
        finish(&self.name, "download", remote, outcome)
    }

    async fn list(&self, prefix: &str, max_results: usize) -> Result<Vec<RemoteObject>> {
        let cancel = CancellationToken::new();
        let mut objects = Vec::new();

        let mut page = match self.list_folder(&cancel, None).await {
            Ok(page) => page,
            // Nothing uploaded yet
            Err(err) if err.class == ErrorClass::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(list_error(&self.name, err)),
        };

        loop {
            objects.extend(
                page.entries
                    .into_iter()
                    .filter(|e| e.name.starts_with(prefix))
                    .filter_map(to_remote),
            );
            if !page.has_more || objects.len() >= max_results {
                break;
            }
            page = self
                .list_folder(&cancel, Some(&page.cursor))
                .await
                .map_err(|e| list_error(&self.name, e))?;
        }

        Ok(bound_listing(objects, prefix, max_results))
    }

    async fn delete(&self, remote: &str) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let path = self.remote_path(remote);
            let path = path.as_str();
            let cancel = CancellationToken::new();
            run_with_retry(&self.retry(), &cancel, "Dropbox delete", |_| async move {
                let _: Value = self.rpc("files/delete_v2", json!({"path": path})).await?;
                Ok(())
            })
            .await?;
            Ok(format!("Deleted dropbox:{}", path))
        }
        .await;
        finish(&self.name, "delete", remote, outcome)
    }

    async fn test_connection(&self) -> bool {
        let url = format!("{}/users/get_current_account", API_URL);
        let result = async move {
            let response = self
                .send("users/get_current_account", |client| {
                    client
                        .post(url)
                        .header("Content-Type", "application/json")
                        .body("null")
                })
                .await?;
            parse::<Value>(response, "users/get_current_account").await
        }
        .await;

        match result {
            Ok(account) => {
                let email = account.get("email").and_then(Value::as_str).unwrap_or("unknown");
                info!(provider = %self.name, account = %email, "Dropbox connection test successful");
                true
            }
            Err(e) => {
                warn!(provider = %self.name, "Dropbox connection test failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_requires_token() {
        let err = DropboxProvider::from_config("dropbox", &ProviderConfig::new()).unwrap_err();
        assert!(err.is_configuration());

        let config = ProviderConfig::from_value(json!({"access_token": "t"}));
        let provider = DropboxProvider::from_config("dropbox", &config).unwrap();
        assert_eq!(provider.folder, DEFAULT_FOLDER);
        assert_eq!(
            provider.remote_path("homeserver_backup_1.tar.gz"),
            "/HOMESERVER Backups/homeserver_backup_1.tar.gz"
        );
    }

    #[test]
    fn test_folder_normalization() {
        assert_eq!(normalize_folder("backups/"), "/backups");
        assert_eq!(normalize_folder("/a/b"), "/a/b");
    }

    #[test]
    fn test_api_arg_escapes_non_ascii() {
        let arg = api_arg(&json!({"path": "/Sauvegardes é"}));
        assert_eq!(arg, r#"{"path":"/Sauvegardes \u00e9"}"#);
    }

    #[test]
    fn test_error_classification() {
        let body = r#"{"error_summary": "path/not_found/..",
            "error": {".tag": "path", "path": {".tag": "not_found"}}}"#;
        assert_eq!(
            classify_dropbox(StatusCode::CONFLICT, body, "download").class,
            ErrorClass::NotFound
        );
        let body = r#"{"error_summary": "path_lookup/not_found/",
            "error": {".tag": "path_lookup", "path_lookup": {".tag": "not_found"}}}"#;
        assert_eq!(
            classify_dropbox(StatusCode::CONFLICT, body, "delete").class,
            ErrorClass::NotFound
        );
        let body = r#"{"error_summary": "path/too_many_write_operations/",
            "error": {".tag": "path", "reason": {".tag": "too_many_write_operations"}}}"#;
        assert!(classify_dropbox(StatusCode::CONFLICT, body, "upload").is_transient());
        assert!(classify_dropbox(StatusCode::TOO_MANY_REQUESTS, "", "upload").is_transient());
    }

    #[test]
    fn test_classification_ignores_summary_text() {
        // Only the tags decide; a file named "not_found" must not turn a conflict into NotFound
        let body = r#"{"error_summary": "path/conflict/file/not_found.tar.gz",
            "error": {".tag": "path", "path": {".tag": "conflict", "conflict": {".tag": "file"}}}}"#;
        let err = classify_dropbox(StatusCode::CONFLICT, body, "create");
        assert_eq!(err.class, ErrorClass::Permanent);
        assert!(err.message.contains("path/conflict/file"));

        let body = r#"{"error_summary": "not_found", "error": {".tag": "other"}}"#;
        assert_eq!(classify_dropbox(StatusCode::CONFLICT, body, "get").class, ErrorClass::Permanent);
    }

    #[test]
    fn test_folder_conflict_detection() {
        let folder = ApiError::from_body(
            r#"{"error_summary": "path/conflict/folder/..",
                "error": {".tag": "path", "path": {".tag": "conflict", "conflict": {".tag": "folder"}}}}"#,
        )
        .unwrap();
        assert_eq!(folder.tags(), vec!["path", "conflict", "folder"]);
        assert!(folder.is_folder_conflict());

        let file = ApiError::from_body(
            r#"{"error_summary": "path/conflict/file/..",
                "error": {".tag": "path", "path": {".tag": "conflict", "conflict": {".tag": "file"}}}}"#,
        )
        .unwrap();
        assert!(!file.is_folder_conflict());

        let denied = ApiError::from_body(
            r#"{"error_summary": "path/no_write_permission/..",
                "error": {".tag": "path", "path": {".tag": "no_write_permission"}}}"#,
        )
        .unwrap();
        assert!(!denied.is_folder_conflict());
    }

    #[test]
    fn test_listing_skips_folders() {
        let page: ListFolder = serde_json::from_value(json!({
            "entries": [
                {".tag": "folder", "name": "old", "id": "id:1"},
                {
                    ".tag": "file",
                    "name": "homeserver_backup_20240101_000000.tar.gz",
                    "id": "id:2",
                    "size": 10,
                    "server_modified": "2024-01-01T00:00:00Z",
                    "content_hash": "abc"
                }
            ],
            "cursor": "c",
            "has_more": false
        }))
        .unwrap();

        let objects: Vec<_> = page.entries.into_iter().filter_map(to_remote).collect();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].size, 10);
        assert_eq!(objects[0].id.as_deref(), Some("id:2"));
    }
}
