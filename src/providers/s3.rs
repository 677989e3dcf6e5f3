//! S3 and S3-compatible object storage provider
//!
//! Requests are signed with SigV4. Objects above `multipart_threshold` go
//! through a multipart upload whose parts are sent concurrently; any failure
//! or cancellation aborts the upload so no incomplete object becomes visible.

use super::http::{build_client, download_to_file, send_error, truncate};
use super::sigv4::{self, AwsCredentials, CanonicalRequest};
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
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const KIND: &str = "aws_s3";

/// Smallest part S3 accepts, except for the last one
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;
const LIST_PAGE: usize = 1000;

/// S3 storage classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum S3StorageClass {
    Standard,
    StandardIa,
    OneZoneIa,
    IntelligentTiering,
    GlacierIr,
    Glacier,
    DeepArchive,
}

impl S3StorageClass {
    pub fn as_aws_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::StandardIa => "STANDARD_IA",
            Self::OneZoneIa => "ONEZONE_IA",
            Self::IntelligentTiering => "INTELLIGENT_TIERING",
            Self::GlacierIr => "GLACIER_IR",
            Self::Glacier => "GLACIER",
            Self::DeepArchive => "DEEP_ARCHIVE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let class = match value.trim().to_ascii_uppercase().as_str() {
            "STANDARD" => Self::Standard,
            "STANDARD_IA" => Self::StandardIa,
            "ONEZONE_IA" => Self::OneZoneIa,
            "INTELLIGENT_TIERING" => Self::IntelligentTiering,
            "GLACIER_IR" => Self::GlacierIr,
            "GLACIER" => Self::Glacier,
            "DEEP_ARCHIVE" => Self::DeepArchive,
            _ => return None,
        };
        Some(class)
    }
}

impl Default for S3StorageClass {
    fn default() -> Self {
        Self::Standard
    }
}

/// Server-side encryption requested on upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSideEncryption {
    Aes256,
    AwsKms { key_id: Option<String> },
}

#[derive(Debug)]
pub struct S3Provider {
    name: String,
    bucket: String,
    region: String,
    endpoint: Url,
    path_style: bool,
    credentials: AwsCredentials,
    storage_class: S3StorageClass,
    server_side_encryption: Option<ServerSideEncryption>,
    acl: Option<String>,
    settings: TransferSettings,
    client: Client,
    throttle: BandwidthThrottle,
    bucket_ready: OnceCell<()>,
}

/// Where a request goes and what gets signed
struct Target {
    url: String,
    host: String,
    uri: String,
    query: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    size: u64,
    last_modified: String,
    #[serde(rename = "ETag")]
    etag: Option<String>,
    storage_class: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

impl S3Provider {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let bucket = config.require_str(name, "bucket")?.to_string();
        let region = config.string_or("region", "us-east-1");

        let (endpoint, default_path_style) = match config.str("endpoint") {
            Some(endpoint) => (endpoint.to_string(), true),
            None => (format!("https://s3.{}.amazonaws.com", region), bucket.contains('.')),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::config(format!("provider '{}': invalid endpoint: {}", name, e)))?;
        let path_style = config.bool("path_style").unwrap_or(default_path_style);

        let credentials = resolve_credentials(name, config)?;

        let storage_class = match config.str("storage_class") {
            Some(value) => S3StorageClass::parse(value).ok_or_else(|| {
                Error::config(format!("provider '{}': unknown storage class '{}'", name, value))
            })?,
            None => S3StorageClass::default(),
        };

        let server_side_encryption = match config.str("server_side_encryption") {
            None => None,
            Some(v) if v.eq_ignore_ascii_case("AES256") => Some(ServerSideEncryption::Aes256),
            Some(v) if v.eq_ignore_ascii_case("aws:kms") => Some(ServerSideEncryption::AwsKms {
                key_id: config.str("sse_kms_key_id").map(String::from),
            }),
            Some(other) => {
                return Err(Error::config(format!(
                    "provider '{}': unsupported server_side_encryption '{}'",
                    name, other
                )))
            }
        };

        let settings = TransferSettings::from_config(config);
        let client = build_client(&settings)?;

        info!(
            provider = %name,
            bucket = %bucket,
            region = %region,
            endpoint = %endpoint,
            storage_class = storage_class.as_aws_str(),
            "S3 provider initialized"
        );

        Ok(Self {
            name: name.to_string(),
            bucket,
            region,
            endpoint,
            path_style,
            credentials,
            storage_class,
            server_side_encryption,
            acl: config.str("canned_acl").or_else(|| config.str("acl")).map(String::from),
            throttle: BandwidthThrottle::new(settings.max_bandwidth),
            settings,
            client,
            bucket_ready: OnceCell::new(),
        })
    }

    fn retry(&self) -> RetryPolicy {
        self.settings.retry_policy()
    }

    fn target(&self, key: &str, query: &[(&str, &str)]) -> Target {
        let scheme = self.endpoint.scheme();
        let mut host = self.endpoint.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.endpoint.port() {
            host = format!("{}:{}", host, port);
        }
        let base = self.endpoint.path().trim_end_matches('/');

        let encoded_key = sigv4::encode_path(key);
        let uri = if self.path_style {
            if key.is_empty() {
                format!("{}/{}", base, self.bucket)
            } else {
                format!("{}/{}/{}", base, self.bucket, encoded_key)
            }
        } else {
            host = format!("{}.{}", self.bucket, host);
            format!("{}/{}", base, encoded_key)
        };

        let query = sigv4::canonical_query(query);
        let url = if query.is_empty() {
            format!("{}://{}{}", scheme, host, uri)
        } else {
            format!("{}://{}{}?{}", scheme, host, uri, query)
        };

        Target {
            url,
            host,
            uri,
            query,
        }
    }

    /// Sign and send one request
    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Outcome<Response> {
        let target = self.target(key, query);
        let now = Utc::now();
        let payload_hash = sigv4::sha256_hex(&body);

        let mut headers = extra_headers;
        headers.push(("host".to_string(), target.host.clone()));
        headers.push(("x-amz-date".to_string(), sigv4::amz_date(now)));
        headers.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let canonical = CanonicalRequest {
            method: method.as_str(),
            uri: &target.uri,
            query: &target.query,
            headers: &headers,
            payload_hash: &payload_hash,
        };
        let authorization = sigv4::authorization(&self.credentials, &self.region, "s3", &canonical, now)?;

        let mut request = self.client.request(method.clone(), &target.url);
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header("authorization", authorization);
        if !body.is_empty() || method == Method::PUT || method == Method::POST {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|e| send_error(&format!("S3 {} {}", method, key), e))
    }

    fn upload_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("content-type".to_string(), "application/octet-stream".to_string()),
            (
                "x-amz-storage-class".to_string(),
                self.storage_class.as_aws_str().to_string(),
            ),
        ];
        match &self.server_side_encryption {
            Some(ServerSideEncryption::Aes256) => {
                headers.push(("x-amz-server-side-encryption".to_string(), "AES256".to_string()));
            }
            Some(ServerSideEncryption::AwsKms { key_id }) => {
                headers.push(("x-amz-server-side-encryption".to_string(), "aws:kms".to_string()));
                if let Some(key_id) = key_id {
                    headers.push((
                        "x-amz-server-side-encryption-aws-kms-key-id".to_string(),
                        key_id.clone(),
                    ));
                }
            }
            None => {}
        }
        if let Some(acl) = &self.acl {
            headers.push(("x-amz-acl".to_string(), acl.clone()));
        }
        headers
    }

    /// Create the bucket on first use when it does not exist
    async fn ensure_bucket(&self, options: &TransferOptions) -> Outcome<()> {
        self.bucket_ready
            .get_or_try_init(|| async move {
                run_with_retry(&self.retry(), &options.cancel, "S3 bucket check", |_| async move {
                    let response = self.send(Method::HEAD, "", &[], Vec::new(), Vec::new()).await?;
                    match response.status() {
                        status if status.is_success() => Ok(()),
                        StatusCode::NOT_FOUND => self.create_bucket().await,
                        _ => Err(s3_error("S3 HEAD bucket", response).await),
                    }
                })
                .await
            })
            .await
            .map(|_| ())
    }

    async fn create_bucket(&self) -> Outcome<()> {
        let body = if self.region == "us-east-1" {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            )
            .into_bytes()
        };

        let response = self.send(Method::PUT, "", &[], Vec::new(), body).await?;
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            info!(provider = %self.name, bucket = %self.bucket, "Created bucket");
            Ok(())
        } else {
            Err(s3_error("S3 create bucket", response).await)
        }
    }

    async fn put_object(&self, local: &Path, key: &str, size: u64, options: &TransferOptions) -> Outcome<()> {
        run_with_retry(&self.retry(), &options.cancel, "S3 put object", |_| async move {
            let body = tokio::fs::read(local)
                .await
                .map_err(|e| ProviderError::io(format!("read {}", local.display()), e))?;
            self.throttle.consume(body.len() as u64).await;

            let response = self
                .send(Method::PUT, key, &[], self.upload_headers(), body)
                .await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(s3_error("S3 PUT", response).await)
            }
        })
        .await?;
        options.report(size, size);
        Ok(())
    }

    async fn multipart_upload(&self, local: &Path, key: &str, size: u64, options: &TransferOptions) -> Outcome<()> {
        let upload_id = run_with_retry(&self.retry(), &options.cancel, "S3 create multipart", |_| async move {
            let response = self
                .send(Method::POST, key, &[("uploads", "")], self.upload_headers(), Vec::new())
                .await?;
            if !response.status().is_success() {
                return Err(s3_error("S3 create multipart upload", response).await);
            }
            let body = response
                .text()
                .await
                .map_err(|e| send_error("S3 create multipart upload", e))?;
            let parsed: InitiateMultipartUploadResult = quick_xml::de::from_str(&body)
                .map_err(|e| ProviderError::transient(format!("unexpected multipart response: {}", e)))?;
            Ok(parsed.upload_id)
        })
        .await?;

        debug!(provider = %self.name, key, upload_id = %upload_id, "Multipart upload started");

        let result = self.upload_parts(local, key, size, &upload_id, options).await;
        if let Err(err) = &result {
            warn!(
                provider = %self.name,
                key,
                upload_id = %upload_id,
                "Aborting multipart upload: {}",
                err
            );
            self.abort_multipart(key, &upload_id).await;
        }
        result
    }

    async fn upload_parts(
        &self,
        local: &Path,
        key: &str,
        size: u64,
        upload_id: &str,
        options: &TransferOptions,
    ) -> Outcome<()> {
        let part_size = part_size(size, self.settings.upload_chunk_size);
        let part_count = size.div_ceil(part_size).max(1);
        let uploaded = AtomicU64::new(0);
        let uploaded = &uploaded;

        info!(
            provider = %self.name,
            key,
            parts = part_count,
            part_size,
            "Uploading in parts"
        );

        let mut parts: Vec<(u64, String)> = stream::iter(1..=part_count)
            .map(|number| async move {
                let offset = (number - 1) * part_size;
                let len = part_size.min(size - offset);
                let etag = self
                    .upload_part(local, key, upload_id, number, offset, len, options)
                    .await?;
                let done = uploaded.fetch_add(len, Ordering::SeqCst) + len;
                options.report(done, size);
                Ok::<_, ProviderError>((number, etag))
            })
            .buffer_unordered(self.settings.multipart_concurrency)
            .try_collect()
            .await?;
        parts.sort_by_key(|(number, _)| *number);

        options.check_cancelled("S3 multipart upload")?;
        self.complete_multipart(key, upload_id, &parts, options).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_part(
        &self,
        local: &Path,
        key: &str,
        upload_id: &str,
        number: u64,
        offset: u64,
        len: u64,
        options: &TransferOptions,
    ) -> Outcome<String> {
        let number = number.to_string();
        let number = number.as_str();
        run_with_retry(&self.retry(), &options.cancel, "S3 upload part", |_| async move {
            let body = read_file_range(local, offset, len as usize).await?;
            self.throttle.consume(body.len() as u64).await;

            let query = [("partNumber", number), ("uploadId", upload_id)];
            let response = self.send(Method::PUT, key, &query, Vec::new(), body).await?;
            if !response.status().is_success() {
                return Err(s3_error("S3 upload part", response).await);
            }
            response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .ok_or_else(|| ProviderError::transient("S3 upload part returned no ETag"))
        })
        .await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u64, String)],
        options: &TransferOptions,
    ) -> Outcome<()> {
        let body = complete_multipart_body(parts);
        let body = body.as_str();
        run_with_retry(&self.retry(), &options.cancel, "S3 complete multipart", |_| async move {
            let response = self
                .send(Method::POST, key, &[("uploadId", upload_id)], Vec::new(), body.as_bytes().to_vec())
                .await?;
            if !response.status().is_success() {
                return Err(s3_error("S3 complete multipart upload", response).await);
            }
            // S3 can report a failure inside a 200 response
            let text = response
                .text()
                .await
                .map_err(|e| send_error("S3 complete multipart upload", e))?;
            if text.contains("<Error>") {
                return Err(classify_s3_body(StatusCode::OK, &text, "S3 complete multipart upload"));
            }
            Ok(())
        })
        .await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        match self
            .send(Method::DELETE, key, &[("uploadId", upload_id)], Vec::new(), Vec::new())
            .await
        {
            Ok(response) if response.status().is_success() || response.status() == StatusCode::NOT_FOUND => {
                debug!(provider = %self.name, key, "Multipart upload aborted");
            }
            Ok(response) => {
                let err = s3_error("S3 abort multipart upload", response).await;
                warn!(provider = %self.name, key, "Failed to abort multipart upload: {}", err);
            }
            Err(err) => {
                warn!(provider = %self.name, key, "Failed to abort multipart upload: {}", err);
            }
        }
    }

    async fn head_object(&self, key: &str) -> Outcome<()> {
        let response = self.send(Method::HEAD, key, &[], Vec::new(), Vec::new()).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::not_found(format!(
                "{} not found in bucket {}",
                key, self.bucket
            ))),
            status => Err(ProviderError::new(
                ErrorClass::from_status(status.as_u16()),
                format!("S3 HEAD {}: {}", key, status),
            )),
        }
    }

    async fn list_page(&self, prefix: &str, max_keys: usize, token: Option<&str>) -> Outcome<ListBucketResult> {
        let max_keys = max_keys.to_string();
        let mut query = vec![("list-type", "2"), ("max-keys", max_keys.as_str())];
        if !prefix.is_empty() {
            query.push(("prefix", prefix));
        }
        if let Some(token) = token {
            query.push(("continuation-token", token));
        }

        let response = self.send(Method::GET, "", &query, Vec::new(), Vec::new()).await?;
        if !response.status().is_success() {
            return Err(s3_error("S3 list objects", response).await);
        }
        let body = response
            .text()
            .await
            .map_err(|e| send_error("S3 list objects", e))?;
        parse_list(&body)
    }
}

fn resolve_credentials(name: &str, config: &ProviderConfig) -> Result<AwsCredentials> {
    let access_key = config
        .str("access_key")
        .or_else(|| config.str("access_key_id"))
        .map(String::from)
        .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok());
    let secret_key = config
        .str("secret_key")
        .or_else(|| config.str("secret_access_key"))
        .map(String::from)
        .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok());
    let session_token = config
        .str("session_token")
        .map(String::from)
        .or_else(|| std::env::var("AWS_SESSION_TOKEN").ok());

    match (access_key, secret_key) {
        (Some(access_key), Some(secret_key)) if !access_key.is_empty() && !secret_key.is_empty() => {
            Ok(AwsCredentials {
                access_key,
                secret_key,
                session_token,
            })
        }
        _ => Err(Error::config(format!(
            "provider '{}' has no access_key/secret_key and no AWS environment credentials",
            name
        ))),
    }
}

/// Part size honouring the S3 minimum and the 10 000 part limit
fn part_size(total: u64, configured: u64) -> u64 {
    let by_limit = total.div_ceil(MAX_PARTS);
    configured.max(MIN_PART_SIZE).max(by_limit)
}

fn complete_multipart_body(parts: &[(u64, String)]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            number, etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn parse_list(body: &str) -> Outcome<ListBucketResult> {
    quick_xml::de::from_str(body)
        .map_err(|e| ProviderError::transient(format!("unexpected list response: {}", e)))
}

fn xml_code(body: &str) -> Option<&str> {
    let start = body.find("<Code>")? + "<Code>".len();
    let end = body[start..].find("</Code>")? + start;
    Some(&body[start..end])
}

/// Classify by the S3 error code when present, else by status
fn classify_s3_body(status: StatusCode, body: &str, context: &str) -> ProviderError {
    let class = match xml_code(body) {
        Some("RequestTimeout" | "InternalError" | "SlowDown" | "ServiceUnavailable" | "RequestTimeTooSkewed") => {
            ErrorClass::Transient
        }
        Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload") => ErrorClass::NotFound,
        Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken") => {
            ErrorClass::Permanent
        }
        _ => ErrorClass::from_status(status.as_u16()),
    };
    ProviderError::new(class, format!("{}: {} {}", context, status, truncate(body)))
}

async fn s3_error(context: &str, response: Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_s3_body(status, &body, context)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Provider for S3Provider {
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
            self.ensure_bucket(options).await?;

            if size >= self.settings.multipart_threshold {
                self.multipart_upload(local, remote, size, options).await?;
            } else {
                self.put_object(local, remote, size, options).await?;
            }
            Ok(format!("Uploaded {} bytes to s3://{}/{}", size, self.bucket, remote))
        }
        .await;
        finish(&self.name, "upload", remote, outcome)
    }

    async fn download(&self, remote: &str, local: &Path, options: &TransferOptions) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            run_with_retry(&self.retry(), &options.cancel, "S3 HEAD object", |_| self.head_object(remote))
                .await?;

            let bytes = run_with_retry(&self.retry(), &options.cancel, "S3 GET object", |_| async move {
                let response = self.send(Method::GET, remote, &[], Vec::new(), Vec::new()).await?;
                if !response.status().is_success() {
                    return Err(s3_error("S3 GET", response).await);
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
        let cancel = tokio_util::sync::CancellationToken::new();
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        while objects.len() < max_results {
            let page_size = (max_results - objects.len()).min(LIST_PAGE);
            let continuation = token.as_deref();
            let page = run_with_retry(&self.retry(), &cancel, "S3 list objects", |_| {
                self.list_page(prefix, page_size, continuation)
            })
            .await
            .map_err(|e| list_error(&self.name, e))?;

            objects.extend(page.contents.into_iter().map(|o| RemoteObject {
                modified: parse_timestamp(&o.last_modified),
                name: o.key,
                size: o.size,
                etag: o.etag.map(|e| e.trim_matches('"').to_string()),
                storage_class: o.storage_class,
                id: None,
            }));

            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }

        Ok(bound_listing(objects, prefix, max_results))
    }

    async fn delete(&self, remote: &str) -> ProviderResult {
        let outcome: Outcome<String> = async {
            validate_remote_name(remote)?;
            let cancel = tokio_util::sync::CancellationToken::new();
            run_with_retry(&self.retry(), &cancel, "S3 HEAD object", |_| self.head_object(remote)).await?;

            run_with_retry(&self.retry(), &cancel, "S3 DELETE object", |_| async move {
                let response = self.send(Method::DELETE, remote, &[], Vec::new(), Vec::new()).await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(s3_error("S3 DELETE", response).await)
                }
            })
            .await?;
            Ok(format!("Deleted s3://{}/{}", self.bucket, remote))
        }
        .await;
        finish(&self.name, "delete", remote, outcome)
    }

    async fn test_connection(&self) -> bool {
        let response = match self.send(Method::HEAD, "", &[], Vec::new(), Vec::new()).await {
            Ok(response) => response,
            Err(e) => {
                warn!(provider = %self.name, "S3 connection failed: {}", e);
                return false;
            }
        };

        match response.status() {
            status if status.is_success() => match self.list_page("", 1, None).await {
                Ok(_) => {
                    info!(provider = %self.name, bucket = %self.bucket, "S3 connection test successful");
                    true
                }
                Err(e) => {
                    warn!(provider = %self.name, "S3 list check failed: {}", e);
                    false
                }
            },
            StatusCode::NOT_FOUND => {
                warn!(
                    provider = %self.name,
                    bucket = %self.bucket,
                    "S3 bucket does not exist; the first upload will create it"
                );
                false
            }
            status => {
                warn!(provider = %self.name, "S3 returned status {}", status);
                false
            }
        }
    }
}
