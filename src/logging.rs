//! Logging Module
//!
//! Initializes the tracing subscriber for the proxy. `RUST_LOG` wins over
//! the configured level when set.

use crate::{ProxyError, Result};
use tracing_subscriber::EnvFilter;

pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| ProxyError::ConfigError(format!("invalid log level {}: {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}
