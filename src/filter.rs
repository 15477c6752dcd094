//! Cache Filter Module
//!
//! The read-through, write-invalidate cache layer interposed in the image
//! API pipeline. On the request side it classifies the request, serves
//! cached bytes for a hit (after checking the registry still agrees the
//! image exists), and otherwise stashes what it learned for the response
//! side. On the response side it populates the cache while streaming GET
//! bodies through to the caller and invalidates entries after a successful
//! DELETE.

use crate::context;
use crate::matcher::{self, CacheMatch};
use crate::registry::{ImageMetadata, ImageRegistry, RequestContext};
use crate::serializer::ImageSerializer;
use crate::store::{
    body_from_stream, empty_stream, stream_from_body, ImageBody, ImageCache,
};
use crate::upstream::Downstream;
use crate::{ProxyError, Result};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Integrity headers consulted when populating the cache from a GET
/// response, in preference order. The two API generations expose the
/// content hash under different names; a future generation is one more
/// entry here.
const CHECKSUM_HEADERS: [&str; 2] = ["content-md5", "x-image-meta-checksum"];

/// The cache filter. Holds the three collaborators it orchestrates and no
/// other state; everything per-request travels in the request itself.
pub struct CacheFilter {
    cache: Arc<dyn ImageCache>,
    registry: Arc<dyn ImageRegistry>,
    serializer: Arc<dyn ImageSerializer>,
}

impl CacheFilter {
    pub fn new(
        cache: Arc<dyn ImageCache>,
        registry: Arc<dyn ImageRegistry>,
        serializer: Arc<dyn ImageSerializer>,
    ) -> Self {
        Self {
            cache,
            registry,
            serializer,
        }
    }

    /// Per-request orchestration: run the request hook, short-circuit on a
    /// cache hit, otherwise hand the request downstream and run the
    /// response hook on what comes back.
    pub async fn handle<D: Downstream + ?Sized>(
        &self,
        mut request: Request<ImageBody>,
        downstream: &D,
    ) -> Result<Response<ImageBody>> {
        if let Some(response) = self.process_request(&mut request).await? {
            return Ok(response);
        }
        // The stash has to outlive the request object, which the downstream
        // handler consumes.
        let stashed = context::fetch_request_info(&request);
        let response = downstream.call(request).await?;
        Ok(self.process_response(response, stashed).await)
    }

    /// Request-side hook.
    ///
    /// Returns `Ok(None)` when the request should proceed downstream,
    /// `Ok(Some(response))` to short-circuit with cached bytes, and
    /// `Err(NotFound)` when the image is cached but the registry reports it
    /// deleted or gone — in which case the stale entry has already been
    /// dropped from the cache.
    pub async fn process_request<B>(
        &self,
        request: &mut Request<B>,
    ) -> Result<Option<Response<ImageBody>>> {
        let CacheMatch {
            version,
            method,
            image_id,
        } = match matcher::match_request(request.method(), request.uri()) {
            Some(matched) => matched,
            None => return Ok(None),
        };

        context::stash_request_info(request, &image_id, method.clone());

        if method != Method::GET || !self.cache.is_cached(&image_id).await {
            return Ok(None);
        }

        debug!("Cache hit for {} image {}", version, image_id);
        let request_context = RequestContext::from_headers(request.headers());
        match self.fetch_from_cache(&request_context, &image_id).await {
            Ok(response) => Ok(Some(response)),
            Err(ProxyError::NotFound(msg)) => {
                info!(
                    "Image {} is cached but no longer valid, removing from cache",
                    image_id
                );
                if let Err(e) = self.cache.delete_cached_image(&image_id).await {
                    warn!("Failed to remove stale cache entry for {}: {}", image_id, e);
                }
                Err(ProxyError::NotFound(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Serve a cache hit: confirm the image against the registry, repair
    /// stale size information, then build the response from the cached byte
    /// stream.
    async fn fetch_from_cache(
        &self,
        request_context: &RequestContext,
        image_id: &str,
    ) -> Result<Response<ImageBody>> {
        let image_meta = self
            .registry
            .get_image_metadata(request_context, image_id)
            .await?;
        let image_meta = self.verify_metadata(image_meta).await?;

        let image_iter = self
            .cache
            .get_caching_iter(image_id, None, empty_stream())
            .await;
        self.serializer.show(&image_meta, image_iter)
    }

    /// Check registry metadata before serving from cache.
    ///
    /// A deleted image is never served regardless of cache presence. A
    /// declared size of 0 is stale upstream bookkeeping, repaired from the
    /// cache's own accounting rather than treated as an empty image.
    pub async fn verify_metadata(&self, mut image_meta: ImageMetadata) -> Result<ImageMetadata> {
        if image_meta.deleted {
            return Err(ProxyError::NotFound(format!(
                "image {} is deleted",
                image_meta.id
            )));
        }
        if image_meta.size == 0 {
            image_meta.size = self.cache.get_image_size(&image_meta.id).await;
        }
        Ok(image_meta)
    }

    /// Response-side hook. With no stashed context this is the identity;
    /// otherwise GET responses feed the cache and DELETE responses
    /// invalidate it.
    pub async fn process_response(
        &self,
        response: Response<ImageBody>,
        stashed: Option<(String, Method)>,
    ) -> Response<ImageBody> {
        let (image_id, method) = match stashed {
            Some(info) => info,
            None => return response,
        };

        match method {
            Method::GET => self.process_get_response(response, &image_id).await,
            Method::DELETE => self.process_delete_response(response, &image_id).await,
            _ => response,
        }
    }

    /// Tee a successful GET response body into the cache while streaming it
    /// through to the caller.
    async fn process_get_response(
        &self,
        response: Response<ImageBody>,
        image_id: &str,
    ) -> Response<ImageBody> {
        if !(200..300).contains(&Self::get_status_code(&response)) {
            return response;
        }

        let checksum = Self::extract_checksum(response.headers());
        debug!(
            "Caching image {} while streaming (checksum: {:?})",
            image_id, checksum
        );

        let (parts, body) = response.into_parts();
        let caching_iter = self
            .cache
            .get_caching_iter(image_id, checksum, stream_from_body(body))
            .await;
        Response::from_parts(parts, body_from_stream(caching_iter))
    }

    /// Drop the cached entry after the authoritative delete succeeded. An
    /// invalidation failure is logged but never masks the delete result.
    async fn process_delete_response(
        &self,
        response: Response<ImageBody>,
        image_id: &str,
    ) -> Response<ImageBody> {
        if (200..300).contains(&Self::get_status_code(&response)) {
            debug!("Removing image {} from cache after DELETE", image_id);
            if let Err(e) = self.cache.delete_cached_image(image_id).await {
                warn!("Failed to invalidate cache for {}: {}", image_id, e);
            }
        }
        response
    }

    /// Status code as declared by the response status line. The legacy
    /// protocol reports deletion through an `x-image-meta-deleted` marker
    /// header without changing the status, so the marker is deliberately
    /// not consulted here.
    pub fn get_status_code<B>(response: &Response<B>) -> u16 {
        response.status().as_u16()
    }

    /// Extract the image checksum from response headers, preferring the v2
    /// content-hash header over the v1 metadata header. Absent or unreadable
    /// headers mean "no checksum", not an error.
    pub fn extract_checksum(headers: &HeaderMap) -> Option<String> {
        CHECKSUM_HEADERS.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_checksum_v1_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-image-meta-checksum", "1234567890".parse().unwrap());
        assert_eq!(
            Some("1234567890".to_string()),
            CacheFilter::extract_checksum(&headers)
        );
    }

    #[test]
    fn test_checksum_v2_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-image-meta-checksum", "1234567890".parse().unwrap());
        headers.insert("content-md5", "abcdefghi".parse().unwrap());
        assert_eq!(
            Some("abcdefghi".to_string()),
            CacheFilter::extract_checksum(&headers)
        );
    }

    #[test]
    fn test_checksum_missing_header() {
        assert_eq!(None, CacheFilter::extract_checksum(&HeaderMap::new()));
    }

    #[test]
    fn test_get_status_code_ignores_deleted_marker() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("x-image-meta-deleted", "true")
            .body(())
            .unwrap();
        assert_eq!(200, CacheFilter::get_status_code(&response));
    }
}
