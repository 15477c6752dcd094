//! Cache Management Module
//!
//! Operator-facing admin surface for the cache: list what is cached, evict
//! a single entry, or evict everything. Runs ahead of the cache filter in
//! the request pipeline and answers its routes directly; anything else
//! passes through untouched.

use crate::store::{empty_body, full_body, ImageBody};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// One cached entry as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct CachedImage {
    pub image_id: String,
    pub size: u64,
}

/// Administrative view of the cache store. Kept separate from the data-path
/// contract so the filter never sees enumeration or bulk eviction.
#[async_trait]
pub trait CacheAdmin: Send + Sync {
    /// All committed entries, ordered by image id.
    async fn get_cached_images(&self) -> Result<Vec<CachedImage>>;

    /// Evict a single entry. Evicting an absent entry is not an error.
    async fn evict_cached_image(&self, image_id: &str) -> Result<()>;

    /// Evict every committed entry, returning how many were removed.
    async fn evict_all_cached_images(&self) -> Result<u64>;
}

/// Routes the `/v1/cached_images` admin endpoints over a [`CacheAdmin`].
pub struct CacheManageFilter {
    admin: Arc<dyn CacheAdmin>,
}

#[derive(Serialize)]
struct CachedImagesEnvelope {
    cached_images: Vec<CachedImage>,
}

#[derive(Serialize)]
struct EvictAllEnvelope {
    num_deleted: u64,
}

impl CacheManageFilter {
    pub fn new(admin: Arc<dyn CacheAdmin>) -> Self {
        Self { admin }
    }

    /// Answer an admin route, or return `Ok(None)` for requests that are
    /// not cache management and should continue through the pipeline.
    pub async fn process_request<B>(
        &self,
        request: &Request<B>,
    ) -> Result<Option<Response<ImageBody>>> {
        let path = request.uri().path().trim_start_matches('/');
        let segments: Vec<&str> = path.split('/').collect();

        match (request.method(), segments.as_slice()) {
            (&Method::GET, ["v1", "cached_images"]) => {
                let cached_images = self.admin.get_cached_images().await?;
                debug!("Listing {} cached images", cached_images.len());
                Ok(Some(json_response(&CachedImagesEnvelope { cached_images })?))
            }
            (&Method::DELETE, ["v1", "cached_images", image_id]) if !image_id.is_empty() => {
                info!("Evicting cached image {}", image_id);
                self.admin.evict_cached_image(image_id).await?;
                Ok(Some(
                    Response::builder()
                        .status(StatusCode::OK)
                        .body(empty_body())?,
                ))
            }
            (&Method::DELETE, ["v1", "cached_images"]) => {
                let num_deleted = self.admin.evict_all_cached_images().await?;
                info!("Evicted {} cached images", num_deleted);
                Ok(Some(json_response(&EvictAllEnvelope { num_deleted })?))
            }
            (_, ["v1", "cached_images"]) | (_, ["v1", "cached_images", _]) => Ok(Some(
                Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .body(empty_body())?,
            )),
            _ => Ok(None),
        }
    }
}

fn json_response<T: Serialize>(payload: &T) -> Result<Response<ImageBody>> {
    let body = serde_json::to_vec(payload)?;
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body))
        .map_err(|e| ProxyError::HttpError(format!("failed to build response: {}", e)))
}
