//! # Configuration Management
//!
//! The server configuration is a JSON document with one section per concern:
//!
//! - [`ServerConfig`]: bind address defaults
//! - [`StorageConfig`]: data directory and the local/cache bucket roots
//! - [`UpstreamSection`]: upstream simple index, timeout and retry policy
//! - [`CacheConfig`]: freshness window of cached index metadata
//! - [`LimitsConfig`]: upload and request body limits
//!
//! Defaults are embedded from `config.json`; operators can point
//! `--config` at their own file.
//!
//! ```rust,no_run
//! # use pypihub_server::config::Config;
//! let config = Config::load_or_default("pypihub.json")?;
//! assert!(config.cache.ttl_secs > 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the index server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration (host, port, scheme)
    pub server: ServerConfig,
    /// Storage paths and directory structure
    pub storage: StorageConfig,
    /// Upstream simple index settings
    pub upstream: UpstreamSection,
    /// Index metadata caching
    #[serde(default)]
    pub cache: CacheConfig,
    /// Upload and request limits (defaults applied if not specified)
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Default host/IP address to bind to (e.g., "0.0.0.0" or "localhost")
    pub default_host: String,
    /// Default port number to listen on
    pub default_port: u16,
    /// URL scheme ("http" or "https")
    pub scheme: String,
}

/// Storage configuration for package files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all package storage
    pub default_data_dir: PathBuf,
    /// Subdirectory holding uploaded packages, one bucket per package
    pub local_dir: PathBuf,
    /// Subdirectory holding mirrored packages and their cache records
    pub cache_dir: PathBuf,
}

/// Upstream simple index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// Base URL of the upstream simple index, without trailing slash
    pub simple_url: String,
    /// Whether upstream lookups are performed at all
    pub enabled: bool,
    /// Bound on every upstream call, and idle bound between download chunks
    pub timeout_secs: u64,
    /// Extra attempts after a failed index fetch
    #[serde(default)]
    pub retries: u32,
    /// Linear backoff step between attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_user_agent() -> String {
    format!("pypihub/{}", env!("CARGO_PKG_VERSION"))
}

/// Index metadata caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum age of a cache record before it is refreshed from upstream
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { ttl_secs: 600 }
    }
}

/// Upload and request limits configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_upload_size_mb: u64,
    pub max_request_body_size_mb: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_upload_size_mb: 100,
            max_request_body_size_mb: 120,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, is not valid JSON, or does not
    /// match the configuration structure.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config_str = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file with fallback to defaults when the file
    /// does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> AppResult<()> {
        url::Url::parse(&self.upstream.simple_url).map_err(|e| {
            AppError::InvalidInput(format!(
                "upstream.simple_url is not a valid URL ({}): {e}",
                self.upstream.simple_url
            ))
        })?;
        if self.upstream.timeout_secs == 0 {
            return Err(AppError::InvalidInput(
                "upstream.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// Get the maximum upload size in bytes.
    pub fn max_upload_size_bytes(&self) -> u64 {
        self.limits.max_upload_size_mb * 1024 * 1024
    }

    /// Get the maximum request body size in bytes.
    pub fn max_request_body_size_bytes(&self) -> usize {
        self.limits.max_request_body_size_mb * 1024 * 1024
    }
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str(include_str!("../config.json"))
            .expect("Failed to parse embedded config.json")
    }
}
