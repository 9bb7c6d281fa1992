/// Google Cloud Storage backend over the JSON API
///
/// Versions are object generations. Conditional writes use
/// `ifGenerationMatch` (0 means "must not exist"); a 412 is a version
/// conflict, not an error. Compose and rewrite are server-side.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::gcs_auth::GcsTokenManager;
use super::{ObjectStore, Precondition, StoreCapabilities, Version, VersionedContent, WriteOutcome};
use crate::error::{CollectorError, Result};
use crate::utils::retry::{retry_with_backoff, RetryPolicy};

const API_BASE: &str = "https://storage.googleapis.com/storage/v1/b";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const GENERATION_HEADER: &str = "x-goog-generation";

/// Absolute GCS limit on compose sources
pub const GCS_MAX_COMPOSE_SOURCES: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    generation: String,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    done: bool,
    #[serde(default)]
    rewrite_token: Option<String>,
}

pub struct GcsStore {
    bucket: String,
    http: reqwest::Client,
    tokens: GcsTokenManager,
    max_compose_sources: usize,
    request_retry: RetryPolicy,
}

impl GcsStore {
    pub fn from_key_file(bucket: String, credentials_path: impl AsRef<Path>, max_compose_sources: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let tokens = GcsTokenManager::from_env_or_key_file(credentials_path, http.clone())?;
        Ok(Self::with_tokens(bucket, http, tokens, max_compose_sources))
    }

    pub fn with_tokens(bucket: String, http: reqwest::Client, tokens: GcsTokenManager, max_compose_sources: usize) -> Self {
        if max_compose_sources > GCS_MAX_COMPOSE_SOURCES {
            warn!(
                "max_compose_sources {} exceeds the GCS limit, clamping to {}",
                max_compose_sources, GCS_MAX_COMPOSE_SOURCES
            );
        }
        GcsStore {
            bucket,
            http,
            tokens,
            max_compose_sources: max_compose_sources.clamp(2, GCS_MAX_COMPOSE_SOURCES),
            request_retry: RetryPolicy::new(3, 250, 2000, 100),
        }
    }

    /// `{base}/{bucket}/o[/{object}][/{suffix}...]` with each part escaped as a single segment
    fn object_url(&self, base: &str, key: Option<&str>, suffix: &[&str]) -> Result<Url> {
        let mut url = Url::parse(base).map_err(|e| CollectorError::InternalError(format!("bad GCS base url: {}", e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CollectorError::InternalError("GCS base url cannot hold a path".to_string()))?;
            segments.push(&self.bucket).push("o");
            if let Some(key) = key {
                segments.push(key);
            }
            for part in suffix {
                segments.push(part);
            }
        }
        Ok(url)
    }

    fn generation_param(precondition: &Precondition) -> Option<String> {
        match precondition {
            Precondition::None => None,
            Precondition::MustNotExist => Some("0".to_string()),
            Precondition::Matches(v) => Some(v.as_str().to_string()),
        }
    }

    async fn authorized(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let token = self.tokens.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Map non-success statuses; 404 and 412 are left for the caller
    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND || status == StatusCode::PRECONDITION_FAILED {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let message = response.text().await.unwrap_or_default();
        Err(Self::status_error(status, message))
    }

    fn status_error(status: StatusCode, message: String) -> CollectorError {
        match status {
            StatusCode::UNAUTHORIZED => CollectorError::StoreTokenRejected(message),
            StatusCode::FORBIDDEN => CollectorError::StoreAuth(message),
            _ => CollectorError::StoreRequest {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// Transient failures, plus 401 (the cached token was dropped, so a fresh one
    /// is fetched on the next attempt). 403 is a permissions problem and is final.
    fn is_retryable(e: &CollectorError) -> bool {
        e.is_transient() || matches!(e, CollectorError::StoreTokenRejected(_))
    }

    async fn metadata(&self, key: &str) -> Result<Option<ObjectResource>> {
        let url = self.object_url(API_BASE, Some(key), &[])?;
        retry_with_backoff(&self.request_retry, "gcs metadata", Self::is_retryable, || {
            let url = url.clone();
            async move {
                let request = self.authorized(Method::GET, url).await?;
                let response = self.check(request.send().await?).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                Ok(Some(response.json::<ObjectResource>().await?))
            }
        })
        .await
    }

    async fn rewrite(&self, source: &str, dest: &str) -> Result<()> {
        let mut rewrite_token: Option<String> = None;
        loop {
            let mut url = self.object_url(API_BASE, Some(source), &["rewriteTo", "b", self.bucket.as_str(), "o", dest])?;
            if let Some(token) = &rewrite_token {
                url.query_pairs_mut().append_pair("rewriteToken", token);
            }
            let response = retry_with_backoff(&self.request_retry, "gcs rewrite", Self::is_retryable, || {
                let url = url.clone();
                async move {
                    let request = self.authorized(Method::POST, url).await?;
                    let response = self.check(request.json(&json!({})).send().await?).await?;
                    if response.status() == StatusCode::NOT_FOUND {
                        return Err(CollectorError::StoreRequest {
                            status: 404,
                            message: format!("rewrite source not found: {}", source),
                        });
                    }
                    Ok(response.json::<RewriteResponse>().await?)
                }
            })
            .await?;

            if response.done {
                return Ok(());
            }
            debug!("Rewrite {} -> {} continuing", source, dest);
            rewrite_token = response.rewrite_token;
        }
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn name(&self) -> &str {
        "gcs"
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            server_compose: true,
            native_append: false,
            max_compose_sources: self.max_compose_sources,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.metadata(key).await?.is_some())
    }

    async fn read_versioned(&self, key: &str) -> Result<VersionedContent> {
        let mut url = self.object_url(API_BASE, Some(key), &[])?;
        url.query_pairs_mut().append_pair("alt", "media");

        retry_with_backoff(&self.request_retry, "gcs read", Self::is_retryable, || {
            let url = url.clone();
            async move {
                let request = self.authorized(Method::GET, url).await?;
                let response = self.check(request.send().await?).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(VersionedContent::default());
                }
                let version = response
                    .headers()
                    .get(GENERATION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(Version::new);
                let bytes = response.bytes().await?.to_vec();
                Ok(VersionedContent { bytes, version })
            }
        })
        .await
    }

    async fn current_version(&self, key: &str) -> Result<Option<Version>> {
        Ok(self.metadata(key).await?.map(|m| Version::new(m.generation)))
    }

    async fn write_whole(&self, key: &str, bytes: Vec<u8>, precondition: Precondition) -> Result<WriteOutcome> {
        let mut url = self.object_url(UPLOAD_BASE, None, &[])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadType", "media").append_pair("name", key);
            if let Some(generation) = Self::generation_param(&precondition) {
                query.append_pair("ifGenerationMatch", &generation);
            }
        }

        // A retried conditional upload whose earlier attempt landed but lost its
        // response gets 412 and reports a conflict. The appender then appends the
        // line again, leaving a duplicate tick. Raw objects are at-least-once.
        retry_with_backoff(&self.request_retry, "gcs upload", Self::is_retryable, || {
            let url = url.clone();
            let body = bytes.clone();
            async move {
                let request = self.authorized(Method::POST, url).await?;
                let response = self
                    .check(
                        request
                            .header(reqwest::header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
                            .body(body)
                            .send()
                            .await?,
                    )
                    .await?;
                match response.status() {
                    StatusCode::PRECONDITION_FAILED => Ok(WriteOutcome::VersionConflict),
                    StatusCode::NOT_FOUND => Err(CollectorError::StoreRequest {
                        status: 404,
                        message: format!("bucket not found: {}", self.bucket),
                    }),
                    _ => {
                        let resource: ObjectResource = response.json().await?;
                        Ok(WriteOutcome::Written(Version::new(resource.generation)))
                    }
                }
            }
        })
        .await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.object_url(API_BASE, None, &[])?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("prefix", prefix)
                    .append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let page = retry_with_backoff(&self.request_retry, "gcs list", Self::is_retryable, || {
                let url = url.clone();
                async move {
                    let request = self.authorized(Method::GET, url).await?;
                    let response = self.check(request.send().await?).await?;
                    if response.status() == StatusCode::NOT_FOUND {
                        return Err(CollectorError::StoreRequest {
                            status: 404,
                            message: format!("bucket not found: {}", self.bucket),
                        });
                    }
                    Ok(response.json::<ListPage>().await?)
                }
            })
            .await?;

            keys.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn compose_into(&self, dest: &str, sources: &[String], precondition: Precondition) -> Result<WriteOutcome> {
        if sources.is_empty() || sources.len() > self.max_compose_sources {
            return Err(CollectorError::InternalError(format!(
                "compose needs 1..={} sources, got {}",
                self.max_compose_sources,
                sources.len()
            )));
        }

        let mut url = self.object_url(API_BASE, Some(dest), &["compose"])?;
        if let Some(generation) = Self::generation_param(&precondition) {
            url.query_pairs_mut().append_pair("ifGenerationMatch", &generation);
        }
        let body = json!({
            "sourceObjects": sources.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>(),
            "destination": { "contentType": NDJSON_CONTENT_TYPE },
        });

        retry_with_backoff(&self.request_retry, "gcs compose", Self::is_retryable, || {
            let url = url.clone();
            let body = body.clone();
            async move {
                let request = self.authorized(Method::POST, url).await?;
                let response = self.check(request.json(&body).send().await?).await?;
                match response.status() {
                    StatusCode::PRECONDITION_FAILED => Ok(WriteOutcome::VersionConflict),
                    StatusCode::NOT_FOUND => Err(CollectorError::StoreRequest {
                        status: 404,
                        message: format!("compose source missing for {}", dest),
                    }),
                    _ => {
                        let resource: ObjectResource = response.json().await?;
                        Ok(WriteOutcome::Written(Version::new(resource.generation)))
                    }
                }
            }
        })
        .await
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        self.rewrite(source, dest).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(API_BASE, Some(key), &[])?;
        retry_with_backoff(&self.request_retry, "gcs delete", Self::is_retryable, || {
            let url = url.clone();
            async move {
                let request = self.authorized(Method::DELETE, url).await?;
                let response = self.check(request.send().await?).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    debug!("Delete of absent object ignored: {}", key);
                }
                Ok(())
            }
        })
        .await
    }

    async fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.metadata(key).await?.and_then(|m| m.updated))
    }
}
