use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const LIST_PAGE_SIZE: u32 = 1000;
const MODIFIED_HEADER: &str = "x-blob-modified";

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("store returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("download integrity check failed for {key}: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        key: String,
        expected_md5: String,
        actual_md5: String,
    },
    #[error("response is missing metadata for {0}")]
    MissingMeta(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl BlobStoreError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            BlobStoreError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// One object in the remote store. Keys are opaque to the store; when
/// end-to-end encryption is enabled they are ciphertext from the caller's
/// point of view.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteItem {
    pub key: String,
    /// Epoch milliseconds.
    pub last_modified: i64,
    pub size: i64,
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoteItemList {
    pub items: Vec<RemoteItem>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteMeta {
    pub last_modified: i64,
    pub size: i64,
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct BlobClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl BlobClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, BlobStoreError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list(
        &self,
        prefix: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<RemoteItemList, BlobStoreError> {
        let mut url = self.endpoint("/v1/blobs")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(prefix) = prefix {
                query.append_pair("prefix", prefix);
            }
            query.append_pair("limit", &limit.to_string());
            query.append_pair("offset", &offset.to_string());
        }
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lists the whole store (or a prefix of it), following pagination.
    pub async fn list_all(&self, prefix: Option<&str>) -> Result<Vec<RemoteItem>, BlobStoreError> {
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self.list(prefix, LIST_PAGE_SIZE, offset).await?;
            offset = offset.saturating_add(page.items.len() as u32);
            let total = page.total;
            items.extend(page.items);
            if offset >= total {
                break;
            }
        }
        Ok(items)
    }

    pub async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        modified: Option<i64>,
    ) -> Result<RemoteMeta, BlobStoreError> {
        let mut url = self.endpoint("/v1/blobs/content")?;
        url.query_pairs_mut().append_pair("key", key);
        let mut request = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .body(content);
        if let Some(modified) = modified {
            request = request.header(MODIFIED_HEADER, modified.to_string());
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    /// Downloads a blob. When an etag is supplied and looks like an md5 hex
    /// digest, the content is verified against it.
    pub async fn get(
        &self,
        key: &str,
        expected_etag: Option<&str>,
    ) -> Result<Vec<u8>, BlobStoreError> {
        let mut url = self.endpoint("/v1/blobs/content")?;
        url.query_pairs_mut().append_pair("key", key);
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let bytes = response.bytes().await?.to_vec();

        if let Some(expected) = expected_etag.filter(|etag| looks_like_md5(etag)) {
            let actual = format!("{:x}", md5::compute(&bytes));
            if actual != expected.to_ascii_lowercase() {
                return Err(BlobStoreError::IntegrityMismatch {
                    key: key.to_string(),
                    expected_md5: expected.to_ascii_lowercase(),
                    actual_md5: actual,
                });
            }
        }
        Ok(bytes)
    }

    pub async fn head(&self, key: &str) -> Result<RemoteMeta, BlobStoreError> {
        let mut url = self.endpoint("/v1/blobs/content")?;
        url.query_pairs_mut().append_pair("key", key);
        let response = self
            .http
            .head(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let headers = response.headers();
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
            .and_then(|time| {
                time.duration_since(std::time::UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_millis() as i64)
            })
            .ok_or_else(|| BlobStoreError::MissingMeta(key.to_string()))?;
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| BlobStoreError::MissingMeta(key.to_string()))?;
        let etag = headers
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string());

        Ok(RemoteMeta {
            last_modified,
            size,
            etag,
        })
    }

    pub async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let mut url = self.endpoint("/v1/blobs/content")?;
        url.query_pairs_mut().append_pair("key", key);
        let response = self
            .http
            .delete(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    pub async fn check_connectivity(&self) -> bool {
        let Ok(url) = self.endpoint("/v1/ping") else {
            return false;
        };
        match self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, BlobStoreError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BlobStoreError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> BlobStoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        BlobStoreError::Api { status, body }
    }
}

fn looks_like_md5(etag: &str) -> bool {
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn md5_etag_detection() {
        assert!(looks_like_md5("5d41402abc4b2a76b9719d911017c592"));
        assert!(!looks_like_md5("W/\"weak\""));
        assert!(!looks_like_md5("short"));
    }
}
