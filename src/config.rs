//! Configuration Module
//!
//! Handles configuration loading from a YAML file with command-line
//! overrides. Every knob has a sensible default so the proxy can run with
//! no configuration at all.

use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

fn default_listen_address() -> String {
    "127.0.0.1:9292".to_string()
}

fn default_upstream_address() -> String {
    "127.0.0.1:9191".to_string()
}

fn default_registry_url() -> String {
    "http://127.0.0.1:9191/v1".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/image-cache-proxy")
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the proxy listens on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Authority of the upstream image API requests are forwarded to
    #[serde(default = "default_upstream_address")]
    pub upstream_address: String,

    /// Base URL of the metadata registry
    #[serde(default = "default_registry_url")]
    pub registry_url: String,

    /// Directory holding cached image files
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Chunk size used when streaming cached entries
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Log level filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            upstream_address: default_upstream_address(),
            registry_url: default_registry_url(),
            cache_dir: default_cache_dir(),
            chunk_size: default_chunk_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from command-line arguments, layered on top of
    /// the config file when one is given.
    pub fn from_args() -> Result<Self> {
        let matches = Command::new("image-cache-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Read-through, write-invalidate cache for an image storage API")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Path to YAML configuration file"),
            )
            .arg(
                Arg::new("listen")
                    .short('l')
                    .long("listen")
                    .value_name("ADDR")
                    .help("Address to listen on"),
            )
            .arg(
                Arg::new("upstream")
                    .short('u')
                    .long("upstream")
                    .value_name("ADDR")
                    .help("Upstream image API authority"),
            )
            .arg(
                Arg::new("registry")
                    .short('r')
                    .long("registry")
                    .value_name("URL")
                    .help("Metadata registry base URL"),
            )
            .arg(
                Arg::new("cache-dir")
                    .short('d')
                    .long("cache-dir")
                    .value_name("DIR")
                    .help("Cache directory"),
            )
            .get_matches();

        let mut config = match matches.get_one::<String>("config") {
            Some(path) => {
                let path = PathBuf::from(path);
                info!("Loading configuration from {}", path.display());
                Self::load_from_file(&path)?
            }
            None => Config::default(),
        };

        if let Some(listen) = matches.get_one::<String>("listen") {
            config.listen_address = listen.clone();
        }
        if let Some(upstream) = matches.get_one::<String>("upstream") {
            config.upstream_address = upstream.clone();
        }
        if let Some(registry) = matches.get_one::<String>("registry") {
            config.registry_url = registry.clone();
        }
        if let Some(cache_dir) = matches.get_one::<String>("cache-dir") {
            config.cache_dir = PathBuf::from(cache_dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ProxyError::ConfigError(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.listen_address == self.upstream_address {
            return Err(ProxyError::ConfigError(
                "listen_address and upstream_address must differ".to_string(),
            ));
        }
        Ok(())
    }
}
