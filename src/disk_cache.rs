//! Disk Cache Module
//!
//! Filesystem-backed image cache store. Each cached image is a single file
//! named after its id; populations stream into a staging file under
//! `incoming/` and are committed with an atomic rename only when the source
//! stream finishes cleanly and the checksum (when one was supplied)
//! verifies. Anything less — a source error, a client disconnect, a torn
//! tee — leaves the staging file discarded and nothing observable as
//! cached.

use crate::cache_manage::{CacheAdmin, CachedImage};
use crate::store::{ByteStream, ImageCache};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, Stream};
use md5::{Digest, Md5};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

const INCOMING_DIR: &str = "incoming";
const WRITE_CHANNEL_CAPACITY: usize = 64;

/// Filesystem image cache store.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    incoming_dir: PathBuf,
    chunk_size: usize,
    sequence: AtomicU64,
}

impl DiskImageCache {
    /// Open (and create if needed) a cache rooted at `cache_dir`. Leftover
    /// staging files from a previous run are swept out.
    pub async fn new(cache_dir: PathBuf, chunk_size: usize) -> Result<Self> {
        let incoming_dir = cache_dir.join(INCOMING_DIR);
        fs::create_dir_all(&incoming_dir).await?;

        let mut stale = fs::read_dir(&incoming_dir).await?;
        while let Some(entry) = stale.next_entry().await? {
            debug!("Removing stale staging file {:?}", entry.path());
            let _ = fs::remove_file(entry.path()).await;
        }

        Ok(Self {
            cache_dir,
            incoming_dir,
            chunk_size,
            sequence: AtomicU64::new(0),
        })
    }

    fn image_path(&self, image_id: &str) -> PathBuf {
        self.cache_dir.join(safe_entry_name(image_id))
    }

    fn incoming_path(&self, image_id: &str) -> PathBuf {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.incoming_dir
            .join(format!("{}.{}.part", safe_entry_name(image_id), seq))
    }
}

/// Image ids are opaque strings; keep entry names inside the cache
/// directory regardless of what they contain.
fn safe_entry_name(image_id: &str) -> String {
    let name: String = image_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name == "." || name == ".." {
        return name.replace('.', "_");
    }
    name
}

fn error_stream(err: ProxyError) -> ByteStream {
    Box::pin(futures::stream::once(future::ready(Err(err))))
}

#[async_trait]
impl ImageCache for DiskImageCache {
    async fn is_cached(&self, image_id: &str) -> bool {
        fs::metadata(self.image_path(image_id))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn get_caching_iter(
        &self,
        image_id: &str,
        image_checksum: Option<String>,
        source: ByteStream,
    ) -> ByteStream {
        // Open directly instead of checking is_cached first: an invalidation
        // can land between an earlier hit check and this read, and a vanished
        // entry must fall through to the population path, not get resurrected.
        match File::open(self.image_path(image_id)).await {
            Ok(file) => return Box::pin(FileChunkStream::new(file, self.chunk_size)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return error_stream(ProxyError::CacheError(format!(
                    "failed to open cached image {}: {}",
                    image_id, e
                )))
            }
        }

        let (sender, receiver) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        tokio::spawn(write_incoming(
            image_id.to_string(),
            self.incoming_path(image_id),
            self.image_path(image_id),
            image_checksum,
            receiver,
        ));
        Box::pin(CachingStream {
            inner: source,
            sender: Some(PollSender::new(sender)),
        })
    }

    async fn delete_cached_image(&self, image_id: &str) -> Result<()> {
        match fs::remove_file(self.image_path(image_id)).await {
            Ok(()) => {
                debug!("Deleted cached image {}", image_id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProxyError::CacheError(format!(
                "failed to delete cached image {}: {}",
                image_id, e
            ))),
        }
    }

    async fn get_image_size(&self, image_id: &str) -> u64 {
        fs::metadata(self.image_path(image_id))
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CacheAdmin for DiskImageCache {
    async fn get_cached_images(&self) -> Result<Vec<CachedImage>> {
        let mut entries = fs::read_dir(&self.cache_dir).await?;
        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            // Skips the incoming/ staging directory along with anything
            // else that is not a committed entry file.
            if !metadata.is_file() {
                continue;
            }
            images.push(CachedImage {
                image_id: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
        images.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(images)
    }

    async fn evict_cached_image(&self, image_id: &str) -> Result<()> {
        self.delete_cached_image(image_id).await
    }

    async fn evict_all_cached_images(&self) -> Result<u64> {
        let mut num_deleted = 0;
        for image in self.get_cached_images().await? {
            self.delete_cached_image(&image.image_id).await?;
            num_deleted += 1;
        }
        Ok(num_deleted)
    }
}

/// What flows from the tee to the staging writer. The explicit `Done`
/// marker is how the writer tells a cleanly finished source apart from an
/// abandoned one: a channel that closes without it means discard.
enum TeeEvent {
    Chunk(Bytes),
    Done,
}

/// Stream wrapper that copies each data chunk to the staging writer while
/// passing the original through to the caller. Capacity is reserved in the
/// tee channel before the next chunk is pulled, so a slow staging writer
/// slows the stream down instead of losing the population.
struct CachingStream {
    inner: ByteStream,
    sender: Option<PollSender<TeeEvent>>,
}

impl Stream for CachingStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(sender) = &mut this.sender {
            match sender.poll_reserve(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => {
                    debug!("Cache writer gone, stopping tee");
                    this.sender = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Some(sender) = &mut this.sender {
                    if sender.send_item(TeeEvent::Chunk(bytes.clone())).is_err() {
                        this.sender = None;
                    }
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Closing the channel without Done makes the writer discard
                // the staging file.
                this.sender = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(mut sender) = this.sender.take() {
                    let _ = sender.send_item(TeeEvent::Done);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Staging writer: drains the tee channel into the staging file and commits
/// it into place on a clean `Done`, verifying the checksum when one was
/// supplied.
async fn write_incoming(
    image_id: String,
    staging_path: PathBuf,
    final_path: PathBuf,
    image_checksum: Option<String>,
    mut receiver: mpsc::Receiver<TeeEvent>,
) {
    let mut file = match File::create(&staging_path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to create staging file for {}: {}", image_id, e);
            return;
        }
    };

    let mut hasher = Md5::new();
    let mut bytes_written: u64 = 0;
    let mut finished = false;

    while let Some(event) = receiver.recv().await {
        match event {
            TeeEvent::Chunk(bytes) => {
                hasher.update(&bytes);
                bytes_written += bytes.len() as u64;
                if let Err(e) = file.write_all(&bytes).await {
                    warn!("Failed to write staging file for {}: {}", image_id, e);
                    drop(file);
                    let _ = fs::remove_file(&staging_path).await;
                    return;
                }
            }
            TeeEvent::Done => {
                finished = true;
                break;
            }
        }
    }

    if !finished {
        debug!("Population of {} abandoned, discarding staging file", image_id);
        drop(file);
        let _ = fs::remove_file(&staging_path).await;
        return;
    }

    if bytes_written == 0 {
        // A population that saw no bytes is an empty-source tee, not an
        // image; committing it would bring an evicted entry back as a
        // zero-byte file.
        debug!("No bytes received for {}, discarding staging file", image_id);
        drop(file);
        let _ = fs::remove_file(&staging_path).await;
        return;
    }

    if let Err(e) = file.flush().await {
        warn!("Failed to flush staging file for {}: {}", image_id, e);
        drop(file);
        let _ = fs::remove_file(&staging_path).await;
        return;
    }
    drop(file);

    if let Some(expected) = image_checksum {
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(&expected) {
            warn!(
                "Checksum mismatch for {}: expected {}, got {}; discarding",
                image_id, expected, actual
            );
            let _ = fs::remove_file(&staging_path).await;
            return;
        }
    }

    match fs::rename(&staging_path, &final_path).await {
        Ok(()) => debug!("Cached image {} ({} bytes)", image_id, bytes_written),
        Err(e) => {
            warn!("Failed to commit cached image {}: {}", image_id, e);
            let _ = fs::remove_file(&staging_path).await;
        }
    }
}

/// Streams a cached entry file in fixed-size chunks.
struct FileChunkStream {
    file: File,
    buf: Vec<u8>,
}

impl FileChunkStream {
    fn new(file: File, chunk_size: usize) -> Self {
        Self {
            file,
            buf: vec![0u8; chunk_size],
        }
    }
}

impl Stream for FileChunkStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut read_buf = ReadBuf::new(&mut this.buf);

        match Pin::new(&mut this.file).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Bytes::copy_from_slice(filled))))
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_entry_name_passthrough() {
        assert_eq!("abc-123_x.img", safe_entry_name("abc-123_x.img"));
    }

    #[test]
    fn test_safe_entry_name_replaces_separators() {
        assert_eq!("a_b_c", safe_entry_name("a/b\\c"));
    }

    #[test]
    fn test_safe_entry_name_dot_entries() {
        assert_eq!("__", safe_entry_name(".."));
        assert_eq!("_", safe_entry_name("."));
    }
}
