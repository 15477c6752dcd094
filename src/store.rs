//! Cache Store Contract
//!
//! Defines the narrow contract the cache filter uses to talk to the physical
//! cache store, plus the byte-stream and body aliases shared across the
//! request/response pipeline. The filter never touches cached bytes through
//! anything wider than this trait.

use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::{Stream, TryStreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, BodyStream, Full, StreamBody};
use hyper::body::Frame;
use std::pin::Pin;

/// Stream of byte chunks flowing between the cache store and the pipeline.
///
/// `Sync` is required so streams can be wrapped into [`ImageBody`] responses.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + Sync + 'static>>;

/// Boxed response/request body used throughout the proxy pipeline.
pub type ImageBody = BoxBody<Bytes, ProxyError>;

/// Contract for the physical cache store, keyed by image id.
///
/// Concurrency is the store's problem, not the filter's: two concurrent
/// populations of the same id may both run, and the store resolves the race
/// (idempotent writes or last-writer-wins, either is acceptable). A stream
/// abandoned mid-population must never leave an entry observable as cached.
#[async_trait]
pub trait ImageCache: Send + Sync {
    /// Whether complete bytes for `image_id` are present in the store.
    async fn is_cached(&self, image_id: &str) -> bool;

    /// Returns an iterator over the image bytes.
    ///
    /// For a cached id this streams the stored bytes and `source` is ignored.
    /// For an uncached id this tees `source` into the store while passing the
    /// chunks through, committing the entry only when the source completes
    /// cleanly and `image_checksum` (when supplied) verifies. An absent
    /// checksum skips verification rather than failing.
    async fn get_caching_iter(
        &self,
        image_id: &str,
        image_checksum: Option<String>,
        source: ByteStream,
    ) -> ByteStream;

    /// Removes the cached entry for `image_id`. Removing an absent entry is
    /// not an error.
    async fn delete_cached_image(&self, image_id: &str) -> Result<()>;

    /// Size in bytes of the cached entry, 0 when absent.
    async fn get_image_size(&self, image_id: &str) -> u64;
}

/// Wrap a byte stream into a boxed streaming body.
pub fn body_from_stream(stream: ByteStream) -> ImageBody {
    BoxBody::new(StreamBody::new(stream.map_ok(Frame::data)))
}

/// Flatten a boxed body into a byte stream, dropping non-data frames.
pub fn stream_from_body(body: ImageBody) -> ByteStream {
    Box::pin(
        BodyStream::new(body)
            .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok()))),
    )
}

/// A complete in-memory body.
pub fn full_body(data: impl Into<Bytes>) -> ImageBody {
    BoxBody::new(Full::new(data.into()).map_err(|never| match never {}))
}

/// An empty body.
pub fn empty_body() -> ImageBody {
    full_body(Bytes::new())
}

/// A stream with no chunks, for cache-hit reads where there is no source to
/// populate from.
pub fn empty_stream() -> ByteStream {
    Box::pin(futures::stream::empty())
}
