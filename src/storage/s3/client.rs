//! SigV4-signed HTTP client for S3-compatible endpoints.
//!
//! Path-style addressing, single-PUT and multipart uploads, paginated
//! ListObjectsV2, bounded retries on transport failure.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, Response};

use crate::types::CancelFlag;
use crate::{Error, Result};

use super::sign::{self, Credentials, EMPTY_PAYLOAD_SHA256};
use super::xml::{self, ListedObject};

/// S3 requires 5 MiB per part, except the last one.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint URL, e.g. `https://s3.us-east-1.amazonaws.com`.
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Multipart threshold and part size; clamped to `MIN_PART_SIZE`.
    pub part_size: u64,
    pub connect_timeout: Duration,
    pub body_timeout: Duration,
}

impl S3Config {
    pub fn new(
        endpoint: impl Into<String>,
        region: impl Into<String>,
        bucket: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: region.into(),
            bucket: bucket.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            part_size: MIN_PART_SIZE,
            connect_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(300),
        }
    }
}

/// Object metadata surfaced from GET/HEAD response headers.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// `x-amz-meta-*` headers, keyed by the suffix.
    pub metadata: BTreeMap<String, String>,
}

pub struct S3Client {
    config: S3Config,
    creds: Credentials,
    host: String,
    base_url: String,
    http: reqwest::Client,
}

impl S3Client {
    pub fn new(config: S3Config) -> Result<Self> {
        let url = reqwest::Url::parse(&config.endpoint)
            .map_err(|e| Error::network(format!("invalid S3 endpoint: {e}")))?;
        let mut host = url
            .host_str()
            .ok_or_else(|| Error::network("S3 endpoint has no host"))?
            .to_string();
        if let Some(port) = url.port() {
            host = format!("{host}:{port}");
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.body_timeout)
            .build()
            .map_err(|e| Error::network(format!("failed to build HTTP client: {e}")))?;

        let base_url = config.endpoint.trim_end_matches('/').to_string();
        let creds = Credentials {
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
        };

        Ok(Self {
            config,
            creds,
            host,
            base_url,
            http,
        })
    }

    pub fn part_size(&self) -> u64 {
        self.config.part_size.max(MIN_PART_SIZE)
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Path-style canonical URI: `/<bucket>/<escaped-key>`. Slashes in the
    /// key survive; everything else outside the unreserved set is escaped.
    fn canonical_uri(&self, key: &str) -> String {
        format!("/{}/{}", self.config.bucket, sign::uri_encode(key, false))
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &BTreeMap<String, String>,
        body: Bytes,
        extra_headers: &BTreeMap<String, String>,
    ) -> Result<Response> {
        let now = Utc::now();
        let payload_hash = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            sign::sha256_hex(&body)
        };

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("host".to_string(), self.host.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert(
            "x-amz-date".to_string(),
            now.format("%Y%m%dT%H%M%SZ").to_string(),
        );
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
        }

        let canonical_uri = self.canonical_uri(key);
        let authorization = sign::authorization_header(
            &self.creds,
            method.as_str(),
            &canonical_uri,
            query,
            &headers,
            &payload_hash,
            now,
        );

        let mut url = format!("{}{}", self.base_url, canonical_uri);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&sign::canonical_query(query));
        }

        let mut request = self.http.request(method, &url);
        for (name, value) in &headers {
            // reqwest derives Host from the URL.
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        request = request.header("authorization", authorization);
        if !body.is_empty() {
            request = request.body(body);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::network(format!("request timed out: {key}"))
            } else {
                Error::network(format!("transport failure: {e}"))
            }
        })
    }

    fn ensure_success(&self, key: &str, response: &Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            401 | 403 => Err(Error::auth(format!(
                "endpoint rejected request for '{key}': {status}"
            ))),
            404 => Err(Error::not_found(key.to_string())),
            _ => Err(Error::network(format!(
                "unexpected status for '{key}': {status}"
            ))),
        }
    }

    /// Single-request object PUT. Returns the ETag reported by the server.
    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let headers = meta_headers(metadata);
        retry(MAX_ATTEMPTS, || async {
            let response = self
                .send(Method::PUT, key, &BTreeMap::new(), body.clone(), &headers)
                .await?;
            self.ensure_success(key, &response)?;
            let etag = header_etag(&response);
            if etag.is_empty() {
                return Err(Error::network(format!("no ETag returned for '{key}'")));
            }
            Ok(etag)
        })
        .await
    }

    /// Whole-object GET.
    pub async fn get_object(&self, key: &str) -> Result<(Bytes, ObjectInfo)> {
        retry(MAX_ATTEMPTS, || async {
            let response = self
                .send(Method::GET, key, &BTreeMap::new(), Bytes::new(), &BTreeMap::new())
                .await?;
            self.ensure_success(key, &response)?;
            let info = object_info(&response);
            let data = response
                .bytes()
                .await
                .map_err(|e| Error::network(format!("body read failed for '{key}': {e}")))?;
            Ok((data, info))
        })
        .await
    }

    pub async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let response = self
            .send(Method::HEAD, key, &BTreeMap::new(), Bytes::new(), &BTreeMap::new())
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        self.ensure_success(key, &response)?;
        Ok(Some(object_info(&response)))
    }

    /// DELETE is idempotent; deleting an absent key succeeds.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let response = self
            .send(Method::DELETE, key, &BTreeMap::new(), Bytes::new(), &BTreeMap::new())
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        self.ensure_success(key, &response)
    }

    /// ListObjectsV2 with continuation-token pagination, drained to the end.
    pub async fn list_all(&self, prefix: &str) -> Result<Vec<ListedObject>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = retry(MAX_ATTEMPTS, || async {
                let mut query = BTreeMap::new();
                query.insert("list-type".to_string(), "2".to_string());
                if !prefix.is_empty() {
                    query.insert("prefix".to_string(), prefix.to_string());
                }
                if let Some(t) = &token {
                    query.insert("continuation-token".to_string(), t.clone());
                }
                let response = self
                    .send(Method::GET, "", &query, Bytes::new(), &BTreeMap::new())
                    .await?;
                self.ensure_success("<list>", &response)?;
                let text = response
                    .text()
                    .await
                    .map_err(|e| Error::network(format!("list body read failed: {e}")))?;
                xml::parse_list_response(&text)
            })
            .await?;

            objects.extend(page.objects);
            if !page.is_truncated {
                break;
            }
            token = page.next_continuation_token;
            if token.is_none() {
                return Err(Error::network(
                    "truncated listing without a continuation token",
                ));
            }
        }

        Ok(objects)
    }

    /// Multipart upload: initiate, N part PUTs, complete. A failed part is
    /// retried; past the retry budget the upload is aborted server-side.
    pub async fn upload_multipart(
        &self,
        key: &str,
        data: Bytes,
        metadata: &BTreeMap<String, String>,
        cancel: Option<&CancelFlag>,
    ) -> Result<String> {
        let upload_id = self.initiate_multipart(key, metadata).await?;

        match self.upload_parts(key, &upload_id, data, cancel).await {
            Ok(etags) => self.complete_multipart(key, &upload_id, &etags).await,
            Err(err) => {
                if let Err(abort_err) = self.abort_multipart(key, &upload_id).await {
                    tracing::warn!(
                        key,
                        error = %abort_err,
                        "failed to abort multipart upload after part failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn initiate_multipart(
        &self,
        key: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let headers = meta_headers(metadata);
        let mut query = BTreeMap::new();
        query.insert("uploads".to_string(), String::new());

        retry(MAX_ATTEMPTS, || async {
            let response = self
                .send(Method::POST, key, &query, Bytes::new(), &headers)
                .await?;
            self.ensure_success(key, &response)?;
            let text = response
                .text()
                .await
                .map_err(|e| Error::network(format!("initiate body read failed: {e}")))?;
            xml::parse_upload_id(&text)
        })
        .await
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: Bytes,
        cancel: Option<&CancelFlag>,
    ) -> Result<Vec<String>> {
        let part_size = self.part_size() as usize;
        let mut etags = Vec::new();
        let mut offset = 0usize;
        let mut part_number = 1u32;

        while offset < data.len() {
            if let Some(flag) = cancel {
                flag.check()?;
            }

            let end = (offset + part_size).min(data.len());
            let part = data.slice(offset..end);

            let mut query = BTreeMap::new();
            query.insert("partNumber".to_string(), part_number.to_string());
            query.insert("uploadId".to_string(), upload_id.to_string());

            let etag = retry(MAX_ATTEMPTS, || async {
                let response = self
                    .send(Method::PUT, key, &query, part.clone(), &BTreeMap::new())
                    .await?;
                self.ensure_success(key, &response)?;
                let etag = header_etag(&response);
                if etag.is_empty() {
                    return Err(Error::network(format!(
                        "no ETag for part {part_number} of '{key}'"
                    )));
                }
                Ok(etag)
            })
            .await?;

            etags.push(etag);
            offset = end;
            part_number += 1;
        }

        Ok(etags)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<String> {
        let body = Bytes::from(xml::compose_complete_multipart(etags));
        let mut query = BTreeMap::new();
        query.insert("uploadId".to_string(), upload_id.to_string());

        retry(MAX_ATTEMPTS, || async {
            let response = self
                .send(Method::POST, key, &query, body.clone(), &BTreeMap::new())
                .await?;
            self.ensure_success(key, &response)?;
            let text = response
                .text()
                .await
                .map_err(|e| Error::network(format!("completion body read failed: {e}")))?;
            xml::parse_completed_etag(&text)
        })
        .await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let mut query = BTreeMap::new();
        query.insert("uploadId".to_string(), upload_id.to_string());
        let response = self
            .send(Method::DELETE, key, &query, Bytes::new(), &BTreeMap::new())
            .await?;
        self.ensure_success(key, &response)
    }
}

fn meta_headers(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (format!("x-amz-meta-{k}"), v.clone()))
        .collect()
}

fn header_etag(response: &Response) -> String {
    response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_default()
}

fn object_info(response: &Response) -> ObjectInfo {
    let headers = response.headers();
    let size = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let last_modified = headers
        .get("last-modified")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let suffix = name.as_str().strip_prefix("x-amz-meta-")?;
            Some((suffix.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    ObjectInfo {
        size,
        etag: header_etag(response),
        last_modified,
        metadata,
    }
}

/// Retry on `Network` only, with exponential backoff between attempts.
async fn retry<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = RETRY_BASE_DELAY_MS << (attempt - 1);
                tracing::debug!(attempt, delay_ms = delay, error = %err, "retrying S3 request");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
