//! Image Cache Proxy - read-through, write-invalidate cache for an image
//! storage API
//!
//! This library interposes a caching filter in the request/response pipeline
//! of an image storage service: cache hits are served directly (after the
//! metadata registry confirms the image still exists), cache misses are
//! populated transparently while the response streams to the caller, and
//! entries are invalidated when the backing image is deleted or found stale.

pub mod cache_manage;
pub mod config;
pub mod context;
pub mod disk_cache;
pub mod error;
pub mod filter;
pub mod logging;
pub mod matcher;
pub mod registry;
pub mod serializer;
pub mod store;
pub mod upstream;

pub use error::{ProxyError, Result};
