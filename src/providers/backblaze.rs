//! Backblaze B2 provider (native API)
//!
//! The account is authorized once and the session is cached; an expired
//! token clears the cache so the next attempt re-authorizes. Large files use
//! the B2 large-file API and are cancelled on failure, so a partial upload
//! never shows up as a finished file.

use super::http::{build_client, download_to_file, send_error, truncate};
use super::sigv4::URI_ENCODE;
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
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use percent_encoding::utf8_percent_encode;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const KIND: &str = "backblaze";

const AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";
const DEFAULT_BUCKET: &str = "homeserver-backups";
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;
const LIST_PAGE: usize = 1000;

/// Cached result of `b2_authorize_account` plus the resolved bucket
#[derive(Debug, Clone)]
struct Session {
    account_id: String,
    token: String,
    api_url: String,
    download_url: String,
    bucket_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    account_id: String,
    authorization_token: String,
    api_url: String,
    download_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketList {
    buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bucket {
    bucket_id: String,
    bucket_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrl {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    file_id: String,
    file_name: String,
    #[serde(default)]
    content_length: u64,
    #[serde(default)]
    upload_timestamp: i64,
    #[serde(default)]
    action: Option<String>,
    content_sha1: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileNames {
    files: Vec<FileInfo>,
    next_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct B2Error {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Whether resolving the bucket may create it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketAccess {
    Existing,
    CreateIfMissing,
}

#[derive(Debug)]
pub struct BackblazeProvider {
    name: String,
    authorize_url: String,
    key_id: String,
    application_key: String,
    bucket: String,
    settings: TransferSettings,
    client: Client,
    throttle: BandwidthThrottle,
    session: RwLock<Option<Session>>,
}

impl BackblazeProvider {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let key_id = config
            .str("application_key_id")
            .or_else(|| config.str("key_id"))
            .ok_or_else(|| {
                Error::config(format!("provider '{}' is missing required field 'application_key_id'", name))
            })?
            .to_string();
        let application_key = config.require_str(name, "application_key")?.to_string();
        let bucket = config
            .str("bucket")
            .or_else(|| config.str("container"))
            .unwrap_or(DEFAULT_BUCKET)
            .to_string();

        let settings = TransferSettings::from_config(config);
        let client = build_client(&settings)?;

        info!(provider = %name, bucket = %bucket, "Backblaze B2 provider initialized");
        Ok(Self {
            name: name.to_string(),
            authorize_url: config.string_or("authorize_url", AUTHORIZE_URL),
            key_id,
            application_key,
            bucket,
            throttle: BandwidthThrottle::new(settings.max_bandwidth),
            settings,
            client,
            session: RwLock::new(None),
        })
    }

    fn retry(&self) -> RetryPolicy {
        self.settings.retry_policy()
    }

    async fn session(&self) -> Outcome<Session> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let response = self
            .client
            .get(&self.authorize_url)
            .basic_auth(&self.key_id, Some(&self.application_key))
            .send()
            .await
            .map_err(|e| send_error("B2 authorize", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let mut err = classify_b2(status, &body, "B2 authorize");
            if status == StatusCode::UNAUTHORIZED {
                err.class = ErrorClass::Permanent;
            }
            return Err(err);
        }
        let auth: AuthorizeResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("B2 authorize: unexpected response: {}", e)))?;
        debug!(provider = %self.name, api_url = %auth.api_url, "Authorized B2 account");

        let session = Session {
            account_id: auth.account_id,
            token: auth.authorization_token,
            api_url: auth.api_url,
            download_url: auth.download_url,
            bucket_id: None,
        };
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Session with the bucket resolved.
    ///
    /// Only uploads pass [`BucketAccess::CreateIfMissing`]; every other
    /// caller gets `NotFound` for a missing bucket.
    async fn bucket_session(&self, access: BucketAccess) -> Outcome<(Session, String)> {
        let session = self.session().await?;
        if let Some(bucket_id) = session.bucket_id.clone() {
            return Ok((session, bucket_id));
        }

        let list: BucketList = self
            .call(
                &session,
                "b2_list_buckets",
                json!({"accountId": session.account_id, "bucketName": self.bucket}),
            )
            .await?;

        let bucket_id = match list.buckets.into_iter().find(|b| b.bucket_name == self.bucket) {
            Some(bucket) => bucket.bucket_id,
            None if access == BucketAccess::Existing => {
                return Err(ProviderError::not_found(format!("bucket {} does not exist", self.bucket)));
            }
            None => {
                let created: Bucket = self
                    .call(
                        &session,
                        "b2_create_bucket",
                        json!({
                            "accountId": session.account_id,
                            "bucketName": self.bucket,
                            "bucketType": "allPrivate",
                        }),
                    )
                    .await?;
                info!(provider = %self.name, bucket = %created.bucket_name, "Created bucket");
                created.bucket_id
            }
        };

        if let Some(cached) = self.session.write().await.as_mut() {
            cached.bucket_id = Some(bucket_id.clone());
        }
        Ok((session, bucket_id))
    }

    /// POST a JSON body to a B2 API operation
    async fn call<T: DeserializeOwned>(&self, session: &Session, operation: &str, body: Value) -> Outcome<T> {
        let url = format!("{}/b2api/v2/{}", session.api_url, operation);
        let response = self
            .client
            .post(url)
            .header("Authorization", &session.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(operation, e))?;
        self.parse(response, operation).await
    }

    async fn parse<T: DeserializeOwned>(&self, response: Response, context: &str) -> Outcome<T> {
        if !response.status().is_success() {
            return Err(self.b2_error(context, response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("{}: unexpected response: {}", context, e)))
    }

    async fn b2_error(&self, context: &str, response: Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let err = classify_b2(status, &body, context);
        if status == StatusCode::UNAUTHORIZED && err.is_transient() {
            debug!(provider = %self.name, "B2 token expired, re-authorizing");
            *self.session.write().await = None;
        }
        err
    }

    async fn upload_small(&self, local: &Path, remote: &str, size: u64, options: &TransferOptions) -> Outcome<()> {
        run_with_retry(&self.retry(), &options.cancel, "B2 upload file", |_| async move {
            let (session, bucket_id) = self.bucket_session(BucketAccess::CreateIfMissing).await?;
            let target: UploadUrl = self
                .call(&session, "b2_get_upload_url", json!({"bucketId": bucket_id}))
                .await?;

            let body = tokio::fs::read(local)
                .await
                .map_err(|e| ProviderError::io(format!("read {}", local.display()), e))?;
            self.throttle.consume(body.len() as u64).await;

            let response = self
                .client
                .post(&target.upload_url)
                .header("Authorization", &target.authorization_token)
                .header("X-Bz-File-Name", encode_file_name(remote))
                .header("Content-Type", "b2/x-auto")
                .header("X-Bz-Content-Sha1", sha1_hex(&body))
                .body(body)
                .send()
                .await
                .map_err(|e| send_error("B2 upload", e))?;
            let _: FileInfo = self.parse(response, "B2 upload").await?;
            Ok(())
        })
        .await?;
        options.report(size, size);
        Ok(())
    }

    async fn upload_large(&self, local: &Path, remote: &str, size: u64, options: &TransferOptions) -> Outcome<()> {
        let started: FileInfo = run_with_retry(&self.retry(), &options.cancel, "B2 start large file", |_| async move {
            let (session, bucket_id) = self.bucket_session(BucketAccess::CreateIfMissing).await?;
            self.call(
                &session,
                "b2_start_large_file",
                json!({"bucketId": bucket_id, "fileName": remote, "contentType": "b2/x-auto"}),
            )
            .await
        })
        .await?;
        let file_id = started.file_id;
        debug!(provider = %self.name, remote, file_id = %file_id, "Large file started");

        let result = self.upload_parts(local, size, &file_id, options).await;
        if let Err(err) = &result {
            warn!(provider = %self.name, remote, "Cancelling large file: {}", err);
            self.cancel_large_file(&file_id).await;
        }
        result
    }

    async fn upload_parts(&self, local: &Path, size: u64, file_id: &str, options: &TransferOptions) -> Outcome<()> {
        let part_size = self
            .settings
            .upload_chunk_size
            .max(MIN_PART_SIZE)
            .max(size.div_ceil(MAX_PARTS));
        let part_count = size.div_ceil(part_size).max(1);
        let uploaded = AtomicU64::new(0);
        let uploaded = &uploaded;

        info!(provider = %self.name, parts = part_count, part_size, "Uploading in parts");

        let mut hashes: Vec<(u64, String)> = stream::iter(1..=part_count)
            .map(|number| async move {
                let offset = (number - 1) * part_size;
                let len = part_size.min(size - offset);
                let sha1 = self.upload_part(local, file_id, number, offset, len, options).await?;
                let done = uploaded.fetch_add(len, Ordering::SeqCst) + len;
                options.report(done, size);
                Ok::<_, ProviderError>((number, sha1))
            })
            .buffer_unordered(self.settings.multipart_concurrency)
            .try_collect()
            .await?;
        hashes.sort_by_key(|(number, _)| *number);
        let hashes: Vec<String> = hashes.into_iter().map(|(_, sha1)| sha1).collect();
        let hashes = &hashes;

        options.check_cancelled("B2 large file upload")?;
        run_with_retry(&self.retry(), &options.cancel, "B2 finish large file", |_| async move {
            let session = self.session().await?;
            let _: FileInfo = self
                .call(
                    &session,
                    "b2_finish_large_file",
                    json!({"fileId": file_id, "partSha1Array": hashes}),
                )
                .await?;
            Ok(())
        })
        .await
    }

    async fn upload_part(
        &self,
        local: &Path,
        file_id: &str,
        number: u64,
        offset: u64,
        len: u64,
        options: &TransferOptions,
    ) -> Outcome<String> {
        run_with_retry(&self.retry(), &options.cancel, "B2 upload part", |_| async move {
            let session = self.session().await?;
            let target: UploadUrl = self
                .call(&session, "b2_get_upload_part_url", json!({"fileId": file_id}))
                .await?;

            let body = read_file_range(local, offset, len as usize).await?;
            let sha1 = sha1_hex(&body);
            self.throttle.consume(body.len() as u64).await;

            let response = self
                .client
                .post(&target.upload_url)
                .header("Authorization", &target.authorization_token)
                .header("X-Bz-Part-Number", number.to_string())
                .header("X-Bz-Content-Sha1", sha1.as_str())
                .body(body)
                .send()
                .await
                .map_err(|e| send_error("B2 upload part", e))?;
            let _: Value = self.parse(response, "B2 upload part").await?;
            Ok(sha1)
        })
        .await
    }

    async fn cancel_large_file(&self, file_id: &str) {
        let result = async {
            let session = self.session().await?;
            self.call::<Value>(&session, "b2_cancel_large_file", json!({"fileId": file_id}))
                .await
        }
        .await;
        if let Err(err) = result {
            warn!(provider = %self.name, file_id, "Failed to cancel large file: {}", err);
        }
    }

    async fn list_page(&self, prefix: &str, max: usize, start: Option<&str>) -> Outcome<FileNames> {
        let (session, bucket_id) = self.bucket_session(BucketAccess::Existing).await?;
        let mut body = json!({
            "bucketId": bucket_id,
            "prefix": prefix,
            "maxFileCount": max,
        });
        if let Some(start) = start {
            body["startFileName"] = json!(start);
        }
        self.call(&session, "b2_list_file_names", body).await
    }

    /// Current version of `remote`, if any
    async fn find_file(&self, remote: &str) -> Outcome<Option<FileInfo>> {
        let page = self.list_page(remote, 1, Some(remote)).await?;
        Ok(page
            .files
            .into_iter()
            .find(|f| f.file_name == remote && f.action.as_deref().unwrap_or("upload") == "upload"))
    }
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// B2 file names travel percent-encoded in headers, with `/` kept
fn encode_file_name(name: &str) -> String {
    name.split('/')
        .map(|part| utf8_percent_encode(part, URI_ENCODE).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn classify_b2(status: StatusCode, body: &str, context: &str) -> ProviderError {
    let parsed: Option<B2Error> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().map(|e| e.code.as_str()).unwrap_or_default();
    let class = match code {
        "expired_auth_token" | "bad_auth_token" => ErrorClass::Transient,
        "service_unavailable" | "too_many_requests" | "internal_error" | "request_timeout" => {
            ErrorClass::Transient
        }
        "not_found" | "no_such_file" | "file_not_present" => ErrorClass::NotFound,
        "unauthorized" | "access_denied" | "cap_exceeded" => ErrorClass::Permanent,
        _ => ErrorClass::from_status(status.as_u16()),
    };
    let message = parsed
        .map(|e| format!("{}: {} {} {}", context, status, e.code, e.message))
        .unwrap_or_else(|| format!("{}: {} {}", context, status, truncate(body)));
    ProviderError::new(class, message)
}

fn to_remote(file: FileInfo) -> RemoteObject {
    let modified = Utc
        .timestamp_millis_opt(file.upload_timestamp)
        .single()
        .unwrap_or_else(Utc::now);
    RemoteObject {
        name: file.file_name,
        size: file.content_length,
        modified,
        etag: file.content_sha1.filter(|s| s != "none"),
        storage_class: None,
        id: Some(file.file_id),
    }
}

#[async_trait]
impl Provider for BackblazeProvider {
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
            let chunk = self.settings.upload_chunk_size.max(MIN_PART_SIZE);
            if size >= self.settings.multipart_threshold && size > chunk {
                self.upload_large(local, remote, size, options).await?;
            } else {
                self.upload_small(local, remote, size, options).await?;
            }
            Ok(format!("Uploaded {} bytes to b2://{}/{}", size, self.bucket, remote))
        }
        .await;
        finish(&self.name, "upload", remote, outcome)
    }

    async fn download(&self, remote: &str, local: &Path, options: &TransferOptions) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let bytes = run_with_retry(&self.retry(), &options.cancel, "B2 download", |_| async move {
                let session = self.session().await?;
                let url = format!(
                    "{}/file/{}/{}",
                    session.download_url,
                    utf8_percent_encode(&self.bucket, URI_ENCODE),
                    encode_file_name(remote)
                );
                let response = self
                    .client
                    .get(url)
                    .header("Authorization", &session.token)
                    .send()
                    .await
                    .map_err(|e| send_error("B2 download", e))?;
                if !response.status().is_success() {
                    return Err(self.b2_error("B2 download", response).await);
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
        let mut start: Option<String> = None;

        while objects.len() < max_results {
            let page_size = (max_results - objects.len()).min(LIST_PAGE);
            let from = start.as_deref();
            let page = match run_with_retry(&self.retry(), &cancel, "B2 list files", |_| {
                self.list_page(prefix, page_size, from)
            })
            .await
            {
                Ok(page) => page,
                Err(err) if err.class == ErrorClass::NotFound && objects.is_empty() => {
                    debug!(provider = %self.name, bucket = %self.bucket, "Bucket missing, nothing to list");
                    return Ok(Vec::new());
                }
                Err(err) => return Err(list_error(&self.name, err)),
            };

            objects.extend(
                page.files
                    .into_iter()
                    .filter(|f| f.action.as_deref().unwrap_or("upload") == "upload")
                    .map(to_remote),
            );

            match page.next_file_name {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        Ok(bound_listing(objects, prefix, max_results))
    }

    async fn delete(&self, remote: &str) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let cancel = CancellationToken::new();
            let file = run_with_retry(&self.retry(), &cancel, "B2 find file", |_| self.find_file(remote))
                .await?
                .ok_or_else(|| ProviderError::not_found(format!("{} not found in bucket {}", remote, self.bucket)))?;
            let file = &file;

            run_with_retry(&self.retry(), &cancel, "B2 delete file", |_| async move {
                let session = self.session().await?;
                let _: Value = self
                    .call(
                        &session,
                        "b2_delete_file_version",
                        json!({"fileName": file.file_name, "fileId": file.file_id}),
                    )
                    .await?;
                Ok(())
            })
            .await?;
            Ok(format!("Deleted b2://{}/{}", self.bucket, remote))
        }
        .await;
        finish(&self.name, "delete", remote, outcome)
    }

    async fn test_connection(&self) -> bool {
        match self.list_page("", 1, None).await {
            Ok(_) => {
                info!(provider = %self.name, bucket = %self.bucket, "B2 connection test successful");
                true
            }
            Err(e) => {
                warn!(provider = %self.name, "B2 connection test failed: {}", e);
                false
            }
        }
    }
}
