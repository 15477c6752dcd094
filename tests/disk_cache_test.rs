//! Disk cache store tests
//!
//! Covers the populate-while-streaming commit boundary: a population is
//! only observable as cached after the source completed cleanly and the
//! checksum (when given) verified. Everything else must leave the cache
//! untouched.

use bytes::Bytes;
use futures::StreamExt;
use image_cache_proxy::disk_cache::DiskImageCache;
use image_cache_proxy::store::{empty_stream, ByteStream, ImageCache};
use image_cache_proxy::{ProxyError, Result};
use md5::{Digest, Md5};
use std::time::Duration;
use tempfile::TempDir;

const CHUNK_SIZE: usize = 4096;

async fn new_cache() -> (DiskImageCache, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let cache = DiskImageCache::new(temp_dir.path().to_path_buf(), CHUNK_SIZE)
        .await
        .unwrap();
    (cache, temp_dir)
}

fn chunk_stream(chunks: Vec<Result<Bytes>>) -> ByteStream {
    Box::pin(futures::stream::iter(chunks))
}

async fn collect_ok(mut stream: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

/// The staging writer commits asynchronously after the consumer finishes,
/// so observations have to poll.
async fn wait_until_cached(cache: &DiskImageCache, image_id: &str) {
    for _ in 0..200 {
        if cache.is_cached(image_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("image {} never became cached", image_id);
}

async fn assert_stays_uncached(cache: &DiskImageCache, image_id: &str) {
    for _ in 0..30 {
        assert!(!cache.is_cached(image_id).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_populate_commits_after_clean_completion() {
    let (cache, _dir) = new_cache().await;
    assert!(!cache.is_cached("img1").await);

    let source = chunk_stream(vec![
        Ok(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"world")),
    ]);
    let passed_through = collect_ok(cache.get_caching_iter("img1", None, source).await).await;
    assert_eq!(b"hello world".to_vec(), passed_through);

    wait_until_cached(&cache, "img1").await;
    assert_eq!(11, cache.get_image_size("img1").await);

    // Reading back a cached entry ignores the source stream entirely.
    let read_back = collect_ok(cache.get_caching_iter("img1", None, empty_stream()).await).await;
    assert_eq!(b"hello world".to_vec(), read_back);
}

#[tokio::test]
async fn test_populate_with_matching_checksum_commits() {
    let (cache, _dir) = new_cache().await;
    let data = b"checksummed image bytes";
    let checksum = hex::encode(Md5::digest(data));

    let source = chunk_stream(vec![Ok(Bytes::from_static(data))]);
    collect_ok(cache.get_caching_iter("img1", Some(checksum), source).await).await;

    wait_until_cached(&cache, "img1").await;
}

#[tokio::test]
async fn test_populate_with_checksum_mismatch_discards() {
    let (cache, _dir) = new_cache().await;

    let source = chunk_stream(vec![Ok(Bytes::from_static(b"corrupted payload"))]);
    collect_ok(
        cache
            .get_caching_iter("img1", Some("d41d8cd98f00b204e9800998ecf8427e".to_string()), source)
            .await,
    )
    .await;

    assert_stays_uncached(&cache, "img1").await;
}

#[tokio::test]
async fn test_populate_with_source_error_discards() {
    let (cache, _dir) = new_cache().await;

    let source = chunk_stream(vec![
        Ok(Bytes::from_static(b"partial")),
        Err(ProxyError::HttpError("connection reset".to_string())),
    ]);
    let mut stream = cache.get_caching_iter("img1", None, source).await;

    assert!(stream.next().await.unwrap().is_ok());
    assert!(stream.next().await.unwrap().is_err());
    assert!(stream.next().await.is_none());

    assert_stays_uncached(&cache, "img1").await;
}

#[tokio::test]
async fn test_abandoned_population_discards() {
    let (cache, _dir) = new_cache().await;

    let source = chunk_stream(vec![
        Ok(Bytes::from_static(b"first")),
        Ok(Bytes::from_static(b"second")),
    ]);
    let mut stream = cache.get_caching_iter("img1", None, source).await;

    // Client disconnects after one chunk: the stream is dropped before the
    // source completes.
    assert!(stream.next().await.unwrap().is_ok());
    drop(stream);

    assert_stays_uncached(&cache, "img1").await;
}

#[tokio::test]
async fn test_empty_population_is_not_committed() {
    let (cache, _dir) = new_cache().await;

    // A source that ends without producing a single byte is not an image.
    let drained = collect_ok(cache.get_caching_iter("img1", None, empty_stream()).await).await;
    assert!(drained.is_empty());

    assert_stays_uncached(&cache, "img1").await;
    assert_eq!(0, cache.get_image_size("img1").await);
}

#[tokio::test]
async fn test_evicted_entry_is_not_resurrected_by_read() {
    let (cache, _dir) = new_cache().await;

    let source = chunk_stream(vec![Ok(Bytes::from_static(b"payload"))]);
    collect_ok(cache.get_caching_iter("img1", None, source).await).await;
    wait_until_cached(&cache, "img1").await;

    // An invalidation can land between a hit check and the read. The read
    // must then behave like a miss, not recreate the entry.
    cache.delete_cached_image("img1").await.unwrap();
    let drained = collect_ok(cache.get_caching_iter("img1", None, empty_stream()).await).await;
    assert!(drained.is_empty());

    assert_stays_uncached(&cache, "img1").await;
    assert_eq!(0, cache.get_image_size("img1").await);
}

#[tokio::test]
async fn test_population_larger_than_writer_backlog_commits_completely() {
    let (cache, _dir) = new_cache().await;

    // Far more chunks than the staging writer's channel can buffer; the tee
    // must slow the consumer down rather than drop the population.
    let chunks: Vec<Result<Bytes>> = (0..256)
        .map(|i| Ok(Bytes::from(vec![i as u8; 1024])))
        .collect();
    let passed_through = collect_ok(cache.get_caching_iter("img1", None, chunk_stream(chunks)).await).await;
    assert_eq!(256 * 1024, passed_through.len());

    wait_until_cached(&cache, "img1").await;
    assert_eq!(256 * 1024, cache.get_image_size("img1").await);
}

#[tokio::test]
async fn test_delete_cached_image() {
    let (cache, _dir) = new_cache().await;

    let source = chunk_stream(vec![Ok(Bytes::from_static(b"bytes"))]);
    collect_ok(cache.get_caching_iter("img1", None, source).await).await;
    wait_until_cached(&cache, "img1").await;

    cache.delete_cached_image("img1").await.unwrap();
    assert!(!cache.is_cached("img1").await);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (cache, _dir) = new_cache().await;
    cache.delete_cached_image("missing").await.unwrap();
    cache.delete_cached_image("missing").await.unwrap();
}

#[tokio::test]
async fn test_size_zero_for_absent_entry() {
    let (cache, _dir) = new_cache().await;
    assert_eq!(0, cache.get_image_size("missing").await);
}

#[tokio::test]
async fn test_ids_with_separators_stay_inside_cache_dir() {
    let (cache, dir) = new_cache().await;

    let source = chunk_stream(vec![Ok(Bytes::from_static(b"x"))]);
    collect_ok(cache.get_caching_iter("../escape", None, source).await).await;
    wait_until_cached(&cache, "../escape").await;

    // Nothing may land outside the cache directory.
    assert!(!dir.path().parent().unwrap().join("escape").exists());
    cache.delete_cached_image("../escape").await.unwrap();
    assert!(!cache.is_cached("../escape").await);
}

#[tokio::test]
async fn test_concurrent_populations_resolve_to_one_entry() {
    let (cache, _dir) = new_cache().await;

    let first = chunk_stream(vec![Ok(Bytes::from_static(b"writer one"))]);
    let second = chunk_stream(vec![Ok(Bytes::from_static(b"writer two"))]);

    let iter_one = cache.get_caching_iter("img1", None, first).await;
    let iter_two = cache.get_caching_iter("img1", None, second).await;
    collect_ok(iter_one).await;
    collect_ok(iter_two).await;

    wait_until_cached(&cache, "img1").await;
    let size = cache.get_image_size("img1").await;
    assert_eq!(10, size);
}
