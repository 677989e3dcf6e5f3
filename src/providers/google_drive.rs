//! Google Drive provider (Drive API v3)
//!
//! Artifacts are stored in one folder, looked up by name and created by the
//! first upload; reads against a missing folder see an empty store. Uploads use resumable sessions in 256 KiB-aligned chunks; a file
//! only exists once the last chunk is accepted. Uploading a name that is
//! already present updates that file in place instead of creating a
//! duplicate.

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
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const KIND: &str = "google_drive";

const API_BASE: &str = "https://www.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_FOLDER: &str = "HOMESERVER Backups";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
/// Resumable chunks must be multiples of this
const CHUNK_ALIGN: u64 = 256 * 1024;
const ABANDON_TIMEOUT: Duration = Duration::from_secs(10);
const FILE_FIELDS: &str = "nextPageToken,files(id,name,size,modifiedTime,md5Checksum)";

#[derive(Debug, Clone)]
struct OAuthRefresh {
    refresh_token: String,
    client_id: String,
    client_secret: String,
    token_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    /// Drive reports sizes as decimal strings
    size: Option<String>,
    modified_time: Option<DateTime<Utc>>,
    md5_checksum: Option<String>,
}

/// State of a resumable session after a chunk
enum ChunkOutcome {
    /// Server holds bytes up to this offset
    Incomplete(u64),
    Complete,
}

pub struct GoogleDriveProvider {
    name: String,
    files_url: String,
    upload_url: String,
    folder_name: String,
    configured_folder: Option<String>,
    folder_id: OnceCell<String>,
    access_token: RwLock<Option<String>>,
    refresh: Option<OAuthRefresh>,
    settings: TransferSettings,
    client: Client,
    throttle: BandwidthThrottle,
}

impl std::fmt::Debug for GoogleDriveProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleDriveProvider")
            .field("name", &self.name)
            .field("folder_name", &self.folder_name)
            .field("folder_id", &self.configured_folder)
            .finish_non_exhaustive()
    }
}

impl GoogleDriveProvider {
    /// Credentials come from `access_token`, from `refresh_token` with
    /// `client_id`/`client_secret`, or from a `token_file` holding the same
    /// fields (`token` is accepted for the access token).
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let file = match config.str("token_file") {
            Some(path) => Some(read_token_file(name, Path::new(path))?),
            None => None,
        };
        let lookup = |key: &str| -> Option<String> {
            config.str(key).map(String::from).or_else(|| {
                file.as_ref()
                    .and_then(|f| f.get(key))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
            })
        };

        let access_token = lookup("access_token").or_else(|| lookup("token"));
        let refresh = match (lookup("refresh_token"), lookup("client_id"), lookup("client_secret")) {
            (Some(refresh_token), Some(client_id), Some(client_secret)) => Some(OAuthRefresh {
                refresh_token,
                client_id,
                client_secret,
                token_uri: lookup("token_uri").unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            }),
            _ => None,
        };
        if access_token.is_none() && refresh.is_none() {
            return Err(Error::config(format!(
                "provider '{}' needs access_token, refresh credentials, or a token_file",
                name
            )));
        }

        let settings = TransferSettings::from_config(config);
        let client = build_client(&settings)?;
        let folder_name = config.string_or("folder_name", DEFAULT_FOLDER);

        let api_base = config.string_or("api_base", API_BASE);
        let api_base = api_base.trim_end_matches('/');

        info!(provider = %name, folder = %folder_name, "Google Drive provider initialized");
        Ok(Self {
            name: name.to_string(),
            files_url: format!("{}/drive/v3/files", api_base),
            upload_url: format!("{}/upload/drive/v3/files", api_base),
            folder_name,
            configured_folder: config.str("folder_id").map(String::from),
            folder_id: OnceCell::new(),
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

    fn chunk_size(&self) -> u64 {
        let chunk = self.settings.upload_chunk_size.max(CHUNK_ALIGN);
        chunk - chunk % CHUNK_ALIGN
    }

    async fn token(&self) -> Outcome<String> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }
        let refresh = self
            .refresh
            .as_ref()
            .ok_or_else(|| ProviderError::permanent("Google access token rejected and no refresh token configured"))?;

        let response = self
            .client
            .post(&refresh.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.refresh_token.as_str()),
                ("client_id", refresh.client_id.as_str()),
                ("client_secret", refresh.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| send_error("Google token refresh", e))?;
        if !response.status().is_success() {
            let mut err = drive_error("Google token refresh", response).await;
            if err.class != ErrorClass::Transient {
                err.class = ErrorClass::Permanent;
            }
            return Err(err);
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("Google token refresh: {}", e)))?;

        debug!(provider = %self.name, "Refreshed Google access token");
        *self.access_token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn send(&self, context: &str, build: impl FnOnce(&Client) -> RequestBuilder) -> Outcome<Response> {
        let token = self.token().await?;
        let response = build(&self.client)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| send_error(context, e))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let mut err = drive_error(context, response).await;
            if self.refresh.is_some() {
                *self.access_token.write().await = None;
                err.class = ErrorClass::Transient;
            }
            return Err(err);
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, context: &str, query: &[(&str, &str)]) -> Outcome<T> {
        let response = self
            .send(context, |client| client.get(&self.files_url).query(query))
            .await?;
        parse(response, context).await
    }

    /// Backup folder for uploads, created when missing
    async fn folder(&self, cancel: &CancellationToken) -> Outcome<String> {
        if let Some(id) = &self.configured_folder {
            return Ok(id.clone());
        }
        self.folder_id
            .get_or_try_init(|| async move {
                run_with_retry(&self.retry(), cancel, "Drive folder lookup", |_| self.find_or_create_folder()).await
            })
            .await
            .cloned()
    }

    /// Backup folder for reads; `None` until an upload has created it
    async fn existing_folder(&self, cancel: &CancellationToken) -> Outcome<Option<String>> {
        if let Some(id) = self.configured_folder.as_ref().or_else(|| self.folder_id.get()) {
            return Ok(Some(id.clone()));
        }
        let found = run_with_retry(&self.retry(), cancel, "Drive folder lookup", |_| self.find_folder()).await?;
        if let Some(id) = &found {
            let _ = self.folder_id.set(id.clone());
        }
        Ok(found)
    }

    async fn find_folder(&self) -> Outcome<Option<String>> {
        let q = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            escape_query(&self.folder_name),
            FOLDER_MIME
        );
        let found: FileList = self
            .get_json("Drive folder lookup", &[("q", q.as_str()), ("fields", "files(id,name)")])
            .await?;
        Ok(found.files.into_iter().next().map(|folder| folder.id))
    }

    async fn find_or_create_folder(&self) -> Outcome<String> {
        if let Some(id) = self.find_folder().await? {
            return Ok(id);
        }

        let body = json!({"name": self.folder_name, "mimeType": FOLDER_MIME});
        let response = self
            .send("Drive create folder", |client| {
                client.post(&self.files_url).query(&[("fields", "id")]).json(&body)
            })
            .await?;
        let created: Value = parse(response, "Drive create folder").await?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ProviderError::transient("Drive create folder returned no id"))?;
        info!(provider = %self.name, folder = %self.folder_name, "Created folder");
        Ok(id)
    }

    /// Non-trashed file named `remote` in the backup folder
    async fn find_file(&self, remote: &str, cancel: &CancellationToken) -> Outcome<Option<DriveFile>> {
        let Some(folder) = self.existing_folder(cancel).await? else {
            return Ok(None);
        };
        let q = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(remote),
            folder
        );
        let query = [("q", q.as_str()), ("fields", FILE_FIELDS)];
        let query = &query[..];
        let found: FileList = run_with_retry(&self.retry(), cancel, "Drive file lookup", |_| {
            self.get_json("Drive file lookup", query)
        })
        .await?;
        Ok(found.files.into_iter().next())
    }

    /// Open a resumable session and return its URI
    async fn start_session(&self, remote: &str, size: u64, existing: Option<&str>, folder: &str) -> Outcome<String> {
        let size = size.to_string();
        let response = match existing {
            Some(id) => {
                let url = format!("{}/{}", self.upload_url, id);
                self.send("Drive start upload", |client| {
                    client
                        .patch(url)
                        .query(&[("uploadType", "resumable")])
                        .header("X-Upload-Content-Type", "application/octet-stream")
                        .header("X-Upload-Content-Length", size.as_str())
                        .json(&json!({}))
                })
                .await?
            }
            None => {
                self.send("Drive start upload", |client| {
                    client
                        .post(&self.upload_url)
                        .query(&[("uploadType", "resumable")])
                        .header("X-Upload-Content-Type", "application/octet-stream")
                        .header("X-Upload-Content-Length", size.as_str())
                        .json(&json!({"name": remote, "parents": [folder]}))
                })
                .await?
            }
        };

        if !response.status().is_success() {
            return Err(drive_error("Drive start upload", response).await);
        }
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| ProviderError::transient("Drive start upload returned no session URI"))
    }

    async fn put_chunk(&self, session: &str, local: &Path, offset: u64, len: u64, total: u64) -> Outcome<ChunkOutcome> {
        let body = read_file_range(local, offset, len as usize).await?;
        self.throttle.consume(body.len() as u64).await;
        let range = if total == 0 {
            "bytes */0".to_string()
        } else {
            format!("bytes {}-{}/{}", offset, offset + len - 1, total)
        };

        let response = self
            .send("Drive upload chunk", |client| {
                client.put(session).header(CONTENT_RANGE, range).body(body)
            })
            .await?;
        chunk_outcome(response, "Drive upload chunk").await
    }

    /// Ask the session how many bytes it already holds
    async fn query_session(&self, session: &str, total: u64) -> Outcome<ChunkOutcome> {
        let response = self
            .send("Drive upload status", |client| {
                client
                    .put(session)
                    .header(CONTENT_RANGE, format!("bytes */{}", total))
                    .body(Vec::new())
            })
            .await?;
        chunk_outcome(response, "Drive upload status").await
    }

    async fn resumable_upload(
        &self,
        local: &Path,
        remote: &str,
        size: u64,
        options: &TransferOptions,
    ) -> Outcome<()> {
        let folder = self.folder(&options.cancel).await?;
        let existing = self.find_file(remote, &options.cancel).await?;
        let existing_id = existing.as_ref().map(|f| f.id.as_str());
        if existing_id.is_some() {
            debug!(provider = %self.name, remote, "Updating existing file in place");
        }

        let folder = folder.as_str();
        let session = run_with_retry(&self.retry(), &options.cancel, "Drive start upload", |_| {
            self.start_session(remote, size, existing_id, folder)
        })
        .await?;
        let session = session.as_str();

        let chunk = self.chunk_size();
        let mut offset = 0u64;
        loop {
            if let Err(err) = options.check_cancelled("Drive upload") {
                self.abandon_session(session).await;
                return Err(err);
            }
            let len = chunk.min(size - offset);
            let from = offset;
            let result = run_with_retry(&self.retry(), &options.cancel, "Drive upload chunk", |attempt| async move {
                if attempt == 0 {
                    self.put_chunk(session, local, from, len, size).await
                } else {
                    // Resume from what the server acknowledged
                    match self.query_session(session, size).await? {
                        ChunkOutcome::Incomplete(held) if held >= from + len => Ok(ChunkOutcome::Incomplete(held)),
                        ChunkOutcome::Incomplete(held) => {
                            let resume = held.max(from);
                            self.put_chunk(session, local, resume, from + len - resume, size).await
                        }
                        done @ ChunkOutcome::Complete => Ok(done),
                    }
                }
            })
            .await;

            match result {
                Ok(ChunkOutcome::Complete) => {
                    options.report(size, size);
                    return Ok(());
                }
                Ok(ChunkOutcome::Incomplete(held)) if held > from && held < size => {
                    offset = held;
                    options.report(offset, size);
                }
                Ok(ChunkOutcome::Incomplete(held)) => {
                    self.abandon_session(session).await;
                    return Err(ProviderError::transient(format!(
                        "Drive upload session stalled at {} of {} bytes",
                        held, size
                    )));
                }
                Err(err) => {
                    self.abandon_session(session).await;
                    return Err(err);
                }
            }
        }
    }

    /// Cancel a resumable session so Drive drops the partial bytes.
    ///
    /// Drive answers a cancelled session with 499. Failures are only logged.
    async fn abandon_session(&self, session: &str) {
        let request = self.client.delete(session).send();
        match tokio::time::timeout(ABANDON_TIMEOUT, request).await {
            Ok(Ok(response)) if response.status().is_success() || response.status().as_u16() == 499 => {
                debug!(provider = %self.name, "Cancelled upload session");
            }
            Ok(Ok(response)) => {
                warn!(provider = %self.name, status = %response.status(), "Failed to cancel upload session");
            }
            Ok(Err(e)) => {
                warn!(provider = %self.name, "Failed to cancel upload session: {}", e);
            }
            Err(_) => {
                warn!(provider = %self.name, timeout = ?ABANDON_TIMEOUT, "Timed out cancelling upload session");
            }
        }
    }

    async fn list_page(&self, folder: &str, page_token: Option<&str>, page_size: usize) -> Outcome<FileList> {
        let q = format!("'{}' in parents and trashed = false", folder);
        let page_size = page_size.to_string();
        let mut query = vec![
            ("q", q.as_str()),
            ("fields", FILE_FIELDS),
            ("orderBy", "name"),
            ("pageSize", page_size.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        self.get_json("Drive list files", &query).await
    }
}

fn read_token_file(name: &str, path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("provider '{}': cannot read token_file {}: {}", name, path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| Error::config(format!("provider '{}': invalid token_file: {}", name, e)))
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Upper bound of a `Range: bytes=0-N` header, as an exclusive offset
fn parse_range(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.trim().strip_prefix("bytes="))
        .and_then(|v| v.split('-').nth(1))
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

async fn chunk_outcome(response: Response, context: &str) -> Outcome<ChunkOutcome> {
    match response.status().as_u16() {
        200 | 201 => Ok(ChunkOutcome::Complete),
        308 => {
            let held = parse_range(response.headers().get(RANGE).and_then(|v| v.to_str().ok()));
            Ok(ChunkOutcome::Incomplete(held))
        }
        _ => Err(drive_error(context, response).await),
    }
}

async fn parse<T: DeserializeOwned>(response: Response, context: &str) -> Outcome<T> {
    if !response.status().is_success() {
        return Err(drive_error(context, response).await);
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::transient(format!("{}: unexpected response: {}", context, e)))
}

async fn drive_error(context: &str, response: Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_drive(status, &body, context)
}

/// Rate limiting arrives as 403 with a `reason`; classify that as transient
fn classify_drive(status: StatusCode, body: &str, context: &str) -> ProviderError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let reason = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/errors/0/reason"))
        .and_then(Value::as_str);
    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| truncate(body).to_string());

    let class = match reason {
        Some("rateLimitExceeded" | "userRateLimitExceeded" | "backendError") => ErrorClass::Transient,
        _ => ErrorClass::from_status(status.as_u16()),
    };
    ProviderError::new(class, format!("{}: {} {}", context, status, message))
}

fn to_remote(file: DriveFile) -> RemoteObject {
    RemoteObject {
        size: file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
        modified: file.modified_time.unwrap_or_else(Utc::now),
        name: file.name,
        etag: file.md5_checksum,
        storage_class: None,
        id: Some(file.id),
    }
}

#[async_trait]
impl Provider for GoogleDriveProvider {
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
            self.resumable_upload(local, remote, size, options).await?;
            Ok(format!("Uploaded {} bytes to drive:{}/{}", size, self.folder_name, remote))
        }
        .await;
        finish(&self.name, "upload", remote, outcome)
    }

    async fn download(&self, remote: &str, local: &Path, options: &TransferOptions) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let file = self.find_file(remote, &options.cancel).await?.ok_or_else(|| {
                ProviderError::not_found(format!("{} not found in {}", remote, self.folder_name))
            })?;
            let url = format!("{}/{}", self.files_url, file.id);
            let url = url.as_str();

            let bytes = run_with_retry(&self.retry(), &options.cancel, "Drive download", |_| async move {
                let response = self
                    .send("Drive download", |client| client.get(url).query(&[("alt", "media")]))
                    .await?;
                if !response.status().is_success() {
                    return Err(drive_error("Drive download", response).await);
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
        let folder = self
            .existing_folder(&cancel)
            .await
            .map_err(|e| list_error(&self.name, e))?;
        let Some(folder) = folder else {
            debug!(provider = %self.name, folder = %self.folder_name, "Folder missing, nothing to list");
            return Ok(Vec::new());
        };
        let folder = folder.as_str();

        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page_token = token.as_deref();
            let page = run_with_retry(&self.retry(), &cancel, "Drive list files", |_| {
                self.list_page(folder, page_token, 1000)
            })
            .await
            .map_err(|e| list_error(&self.name, e))?;

            objects.extend(
                page.files
                    .into_iter()
                    .filter(|f| f.name.starts_with(prefix))
                    .map(to_remote),
            );
            match page.next_page_token {
                Some(next) if objects.len() < max_results => token = Some(next),
                _ => break,
            }
        }

        Ok(bound_listing(objects, prefix, max_results))
    }

    async fn delete(&self, remote: &str) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let cancel = CancellationToken::new();
            let file = self.find_file(remote, &cancel).await?.ok_or_else(|| {
                ProviderError::not_found(format!("{} not found in {}", remote, self.folder_name))
            })?;
            let url = format!("{}/{}", self.files_url, file.id);
            let url = url.as_str();

            run_with_retry(&self.retry(), &cancel, "Drive delete", |_| async move {
                let response = self.send("Drive delete", |client| client.delete(url)).await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(drive_error("Drive delete", response).await)
                }
            })
            .await?;
            Ok(format!("Deleted drive:{}/{}", self.folder_name, remote))
        }
        .await;
        finish(&self.name, "delete", remote, outcome)
    }

    async fn test_connection(&self) -> bool {
        match self
            .get_json::<Value>("Drive connection test", &[("pageSize", "1"), ("fields", "files(id)")])
            .await
        {
            Ok(_) => {
                info!(provider = %self.name, "Google Drive connection test successful");
                true
            }
            Err(e) => {
                warn!(provider = %self.name, "Google Drive connection test failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stub_http::{Recorded, StubServer};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    /// Drive account without the backup folder; cancelled sessions answer 499
    async fn empty_drive() -> StubServer {
        StubServer::start(|request: &Recorded, _base: &str| match request.method.as_str() {
            "GET" => (200, json!({"files": []}).to_string()),
            "POST" => (200, json!({"id": "folder1"}).to_string()),
            "DELETE" => (499, String::new()),
            _ => (400, json!({"error": {"code": 400, "message": "unexpected"}}).to_string()),
        })
        .await
    }

    fn stub_provider(server: &StubServer) -> GoogleDriveProvider {
        let config = ProviderConfig::new()
            .with("access_token", "t")
            .with("api_base", server.url.clone())
            .with("retry_delay", 0.001);
        GoogleDriveProvider::from_config("google_drive", &config).unwrap()
    }

    #[test]
    fn test_config_sources() {
        let err = GoogleDriveProvider::from_config("google_drive", &ProviderConfig::new()).unwrap_err();
        assert!(err.is_configuration());

        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        write!(
            token_file,
            "{}",
            json!({
                "token": "ya29.token",
                "refresh_token": "1//refresh",
                "client_id": "id.apps.googleusercontent.com",
                "client_secret": "secret"
            })
        )
        .unwrap();

        let config = ProviderConfig::new().with("token_file", token_file.path().to_string_lossy().to_string());
        let provider = GoogleDriveProvider::from_config("google_drive", &config).unwrap();
        let refresh = provider.refresh.as_ref().unwrap();
        assert_eq!(refresh.token_uri, DEFAULT_TOKEN_URI);
        assert_eq!(refresh.client_id, "id.apps.googleusercontent.com");
        assert_eq!(provider.folder_name, DEFAULT_FOLDER);
    }

    #[test]
    fn test_chunk_alignment() {
        let config = ProviderConfig::new()
            .with("access_token", "t")
            .with("upload_chunk_size", 1_000_000);
        let provider = GoogleDriveProvider::from_config("google_drive", &config).unwrap();
        assert_eq!(provider.chunk_size(), 3 * CHUNK_ALIGN);
    }

    #[test]
    fn test_range_header() {
        assert_eq!(parse_range(Some("bytes=0-262143")), 262_144);
        assert_eq!(parse_range(None), 0);
        assert_eq!(parse_range(Some("garbage")), 0);
    }

    #[test]
    fn test_query_escaping() {
        assert_eq!(escape_query("it's"), "it\\'s");
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let body = r#"{"error": {"code": 403, "message": "Rate Limit Exceeded",
            "errors": [{"reason": "userRateLimitExceeded"}]}}"#;
        let err = classify_drive(StatusCode::FORBIDDEN, body, "upload");
        assert!(err.is_transient());
        assert!(err.message.contains("Rate Limit Exceeded"));

        let body = r#"{"error": {"code": 403, "message": "Forbidden", "errors": [{"reason": "forbidden"}]}}"#;
        assert_eq!(classify_drive(StatusCode::FORBIDDEN, body, "upload").class, ErrorClass::Permanent);
        assert_eq!(classify_drive(StatusCode::NOT_FOUND, "", "get").class, ErrorClass::NotFound);
    }

    #[test]
    fn test_file_conversion() {
        let list: FileList = serde_json::from_value(json!({
            "files": [{
                "id": "1abc",
                "name": "homeserver_backup_20240101_000000.tar.gz",
                "size": "2048",
                "modifiedTime": "2024-01-01T00:00:00.000Z",
                "md5Checksum": "d41d8cd98f00b204e9800998ecf8427e"
            }]
        }))
        .unwrap();
        let object = to_remote(list.files[0].clone());
        assert_eq!(object.size, 2048);
        assert_eq!(object.id.as_deref(), Some("1abc"));
        assert!(list.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_reads_never_create_the_folder() {
        let server = empty_drive().await;
        let provider = stub_provider(&server);
        let dir = tempfile::TempDir::new().unwrap();
        let name = "homeserver_backup_20240101_000000.tar.gz";

        assert!(provider.test_connection().await);
        assert!(provider.list("", 100).await.unwrap().is_empty());
        let download = provider.download(name, &dir.path().join("out"), &TransferOptions::new()).await;
        assert_eq!(download.error, Some(ErrorClass::NotFound));
        let delete = provider.delete(name).await;
        assert_eq!(delete.error, Some(ErrorClass::NotFound));

        let methods: Vec<_> = server.requests().into_iter().map(|r| r.method).collect();
        assert!(!methods.is_empty());
        assert!(methods.iter().all(|m| m == "GET"), "{:?}", methods);
        assert!(provider.folder_id.get().is_none());
    }

    #[tokio::test]
    async fn test_upload_folder_is_created_once() {
        let server = empty_drive().await;
        let provider = stub_provider(&server);
        let cancel = CancellationToken::new();

        assert_eq!(provider.folder(&cancel).await.unwrap(), "folder1");
        assert_eq!(provider.existing_folder(&cancel).await.unwrap().as_deref(), Some("folder1"));
        let creates = server.requests().into_iter().filter(|r| r.method == "POST").count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_abandoned_session_is_deleted_before_returning() {
        let server = empty_drive().await;
        let provider = stub_provider(&server);

        provider.abandon_session(&format!("{}/session/abc", server.url)).await;
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "DELETE");
        assert_eq!(requests[0].target, "/session/abc");
    }
}
