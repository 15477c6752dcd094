//! Upstream Module
//!
//! The handler the cache filter wraps. In production this forwards requests
//! to the image API service behind the proxy; in tests it is any double
//! implementing [`Downstream`].

use crate::store::ImageBody;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// The downstream handler a request proceeds to when the filter does not
/// short-circuit it.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn call(&self, request: Request<ImageBody>) -> Result<Response<ImageBody>>;
}

/// Forwards requests to the upstream image API over HTTP with a pooled
/// client, preserving method, path, query, headers and body.
pub struct HttpUpstream {
    client: Client<HttpConnector, ImageBody>,
    authority: String,
}

impl HttpUpstream {
    /// Create a forwarder for `authority`, e.g. `127.0.0.1:9292`.
    pub fn new(authority: &str) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();
        Self {
            client,
            authority: authority.to_string(),
        }
    }
}

#[async_trait]
impl Downstream for HttpUpstream {
    async fn call(&self, request: Request<ImageBody>) -> Result<Response<ImageBody>> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::builder()
            .scheme("http")
            .authority(self.authority.as_str())
            .path_and_query(path_and_query)
            .build()?;

        debug!("Forwarding {} {} upstream", parts.method, parts.uri);

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| ProxyError::HttpError(format!("upstream request failed: {}", e)))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(
            parts,
            BoxBody::new(body.map_err(ProxyError::from)),
        ))
    }
}
