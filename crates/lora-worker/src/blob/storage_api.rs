//! Supabase-Storage-style REST blob store.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, RequestBuilder, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::error::{BlobError, Result};
use super::{validate_key, BlobObject, BlobStore};
use crate::sanitize::{redact_signed_url, truncate_message};

const MAX_ERROR_BODY_LENGTH: usize = 300;

/// Seconds a signed download URL stays valid.
const SIGNED_URL_TTL_SECS: u64 = 3600;

pub struct StorageApiBlobStore {
    client: Client,
    base: Url,
    bucket: String,
    key: SecretString,
    page_size: usize,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
    offset: usize,
    #[serde(rename = "sortBy")]
    sort_by: SortBy,
}

#[derive(Serialize)]
struct SortBy {
    column: &'static str,
    order: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    /// Null for folder placeholders.
    id: Option<String>,
    #[serde(default)]
    metadata: Option<EntryMetadata>,
}

#[derive(Debug, Deserialize)]
struct EntryMetadata {
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

impl StorageApiBlobStore {
    pub fn new(
        base_url: &str,
        bucket: &str,
        key: SecretString,
        timeout: Duration,
        page_size: usize,
    ) -> Result<Self> {
        let base =
            Url::parse(base_url.trim_end_matches('/')).map_err(|e| BlobError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(BlobError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base,
            bucket: bucket.to_string(),
            key,
            page_size: page_size.max(1),
        })
    }

    /// `<base>/storage/v1/<segments..>/<bucket>/<key segments..>`, percent-encoded.
    fn object_url(&self, action: &[&str], key: Option<&str>) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BlobError::InvalidUrl(self.base.to_string()))?;
            segments.pop_if_empty().extend(["storage", "v1"]);
            segments.extend(action);
            segments.push(&self.bucket);
            if let Some(key) = key {
                segments.extend(key.trim_matches('/').split('/'));
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let key = self.key.expose_secret();
        request
            .header("apikey", key)
            .header("Authorization", format!("Bearer {}", key))
    }

    async fn check(response: reqwest::Response, key: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound {
                key: key.to_string(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(BlobError::Rejected {
            status: status.as_u16(),
            body: truncate_message(&body, MAX_ERROR_BODY_LENGTH),
        })
    }

    async fn signed_url(&self, key: &str) -> Result<Url> {
        let response = self
            .authorized(self.client.post(self.object_url(&["object", "sign"], Some(key))?))
            .json(&json!({ "expiresIn": SIGNED_URL_TTL_SECS }))
            .send()
            .await?;
        let signed: SignResponse = Self::check(response, key)
            .await?
            .json()
            .await
            .map_err(|e| BlobError::Decode(e.to_string()))?;

        // The API answers with a path relative to `/storage/v1`.
        let raw = if signed.signed_url.starts_with("http://") || signed.signed_url.starts_with("https://") {
            signed.signed_url
        } else {
            format!(
                "{}/storage/v1/{}",
                self.base.as_str().trim_end_matches('/'),
                signed.signed_url.trim_start_matches('/')
            )
        };
        debug!(url = %redact_signed_url(&raw), "Signed download URL");
        Url::parse(&raw).map_err(|e| BlobError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl BlobStore for StorageApiBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>> {
        let url = self.object_url(&["object", "list"], None)?;
        let prefix = prefix.trim_matches('/');
        let mut objects = Vec::new();
        let mut offset = 0;

        loop {
            let request = ListRequest {
                prefix,
                limit: self.page_size,
                offset,
                sort_by: SortBy {
                    column: "name",
                    order: "asc",
                },
            };
            let response = self
                .authorized(self.client.post(url.clone()))
                .json(&request)
                .send()
                .await?;
            let page: Vec<ListEntry> = Self::check(response, prefix)
                .await?
                .json()
                .await
                .map_err(|e| BlobError::Decode(e.to_string()))?;

            let fetched = page.len();
            objects.extend(page.into_iter().filter(|e| e.id.is_some()).map(|e| {
                let size = e.metadata.and_then(|m| m.size);
                BlobObject::new(prefix, &e.name, size)
            }));

            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }

        debug!(bucket = %self.bucket, prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<u64> {
        validate_key(key)?;
        let url = self.signed_url(key).await?;
        let mut response = Self::check(self.client.get(url).send().await?, key).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| BlobError::io(dest, e))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| BlobError::io(dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| BlobError::io(dest, e))?;
        Ok(written)
    }

    async fn put(&self, key: &str, src: &Path) -> Result<()> {
        validate_key(key)?;
        // Artifacts are hundreds of megabytes; stream instead of buffering.
        let file = tokio::fs::File::open(src)
            .await
            .map_err(|e| BlobError::io(src, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| BlobError::io(src, e))?
            .len();
        let response = self
            .authorized(self.client.post(self.object_url(&["object"], Some(key))?))
            .header("x-upsert", "true")
            .header("Content-Type", "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(Body::from(file))
            .send()
            .await?;
        Self::check(response, key).await?;
        Ok(())
    }

    fn reference(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, key.trim_matches('/'))
    }
}
