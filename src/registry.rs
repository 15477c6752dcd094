//! Metadata Registry Module
//!
//! The registry is the source of truth for image existence, visibility,
//! deletion state and declared size. The cache filter consults it before
//! serving anything out of the cache; it never writes back. `HttpRegistry`
//! talks to the registry service over HTTP, mirroring the single call this
//! proxy needs from the wider registry API.

use crate::store::empty_body;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::HeaderMap;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Authoritative image metadata as reported by the registry. Read-only from
/// the filter's point of view. A declared size of 0 means "unknown" for
/// anything actually carrying bytes and gets backfilled from the cache's own
/// accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub container_format: Option<String>,
    #[serde(default)]
    pub disk_format: Option<String>,
}

/// Caller identity threaded from the inbound request to registry lookups.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub auth_token: Option<String>,
}

impl RequestContext {
    /// Build a context from inbound request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let auth_token = headers
            .get("x-auth-token")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Self { auth_token }
    }
}

/// Contract for the authoritative metadata registry.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Fetch metadata for `image_id`, failing with
    /// [`ProxyError::NotFound`] when the registry has no record.
    async fn get_image_metadata(
        &self,
        context: &RequestContext,
        image_id: &str,
    ) -> Result<ImageMetadata>;
}

/// Registry responses wrap the metadata in an `image` envelope.
#[derive(Debug, Deserialize)]
struct ImageEnvelope {
    image: ImageMetadata,
}

/// HTTP client for the registry service.
pub struct HttpRegistry {
    client: Client<HttpConnector, crate::store::ImageBody>,
    base_url: String,
}

impl HttpRegistry {
    /// Create a registry client for `base_url`, e.g.
    /// `http://127.0.0.1:9191/v1`.
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn image_uri(&self, image_id: &str) -> Result<Uri> {
        let url = format!("{}/images/{}", self.base_url, image_id);
        url.parse::<Uri>()
            .map_err(|e| ProxyError::RegistryError(format!("invalid registry URI {}: {}", url, e)))
    }
}

#[async_trait]
impl ImageRegistry for HttpRegistry {
    async fn get_image_metadata(
        &self,
        context: &RequestContext,
        image_id: &str,
    ) -> Result<ImageMetadata> {
        let uri = self.image_uri(image_id)?;
        debug!("Fetching image metadata from registry: {}", uri);

        let mut builder = Request::get(uri);
        if let Some(token) = &context.auth_token {
            builder = builder.header("x-auth-token", token);
        }
        let request = builder.body(empty_body())?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ProxyError::RegistryError(format!("registry request failed: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(ProxyError::NotFound(format!(
                    "no image record for {}",
                    image_id
                )))
            }
            status if !status.is_success() => {
                return Err(ProxyError::RegistryError(format!(
                    "registry returned {} for image {}",
                    status, image_id
                )))
            }
            _ => {}
        }

        let body = response.into_body().collect().await?.to_bytes();
        let envelope: ImageEnvelope = serde_json::from_slice(&body)?;
        Ok(envelope.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_envelope_parsing() {
        let raw = r#"{
            "image": {
                "id": "asdf",
                "name": "cirros",
                "checksum": "1234567890",
                "is_public": true,
                "deleted": false,
                "size": 20,
                "container_format": "bare",
                "disk_format": "qcow2"
            }
        }"#;
        let envelope: ImageEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.image.id, "asdf");
        assert_eq!(envelope.image.size, 20);
        assert!(!envelope.image.deleted);
        assert_eq!(envelope.image.checksum.as_deref(), Some("1234567890"));
    }

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        let raw = r#"{"image": {"id": "asdf"}}"#;
        let envelope: ImageEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.image.size, 0);
        assert!(!envelope.image.deleted);
        assert_eq!(envelope.image.checksum, None);
    }

    #[test]
    fn test_request_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-token", "secret".parse().unwrap());
        let context = RequestContext::from_headers(&headers);
        assert_eq!(context.auth_token.as_deref(), Some("secret"));

        let context = RequestContext::from_headers(&HeaderMap::new());
        assert_eq!(context.auth_token, None);
    }
}
