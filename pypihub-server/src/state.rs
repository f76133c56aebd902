//! # Application State
//!
//! [`AppState`] wires the core components together once per process and is
//! shared by every request handler behind an `Arc`. Nothing in it is global:
//! tests build their own state around a temporary directory and a fake
//! upstream.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pypihub_server::{AppState, Config};
//!
//! let state = Arc::new(AppState::from_config(Config::default(), "./data".into())?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cache_manager::{CacheManager, CacheSettings};
use crate::config::Config;
use crate::error::AppResult;
use crate::record_store::{DiskRecordStore, RecordStore};
use crate::resolver::IndexResolver;
use crate::storage::{OpenArtifact, Storage};
use crate::types::{Artifact, Origin, PackageName};
use crate::upload::UploadHandler;
use crate::upstream::{UpstreamClient, UpstreamConfig, UpstreamIndex};

/// Shared components of a running server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Base directory holding the local and cache roots
    pub data_dir: PathBuf,
    pub storage: Storage,
    pub cache: CacheManager,
    pub resolver: IndexResolver,
    pub uploads: UploadHandler,
}

impl AppState {
    /// State backed by the real upstream client and on-disk cache records.
    pub fn from_config(config: Config, data_dir: PathBuf) -> AppResult<Self> {
        let upstream = UpstreamClient::new(UpstreamConfig::from_config(&config))?;
        Ok(Self::new(config, data_dir, Arc::new(upstream)))
    }

    pub fn new(config: Config, data_dir: PathBuf, upstream: Arc<dyn UpstreamIndex>) -> Self {
        let storage = Storage::from_data_dir(&data_dir, &config.storage);
        let records = Arc::new(DiskRecordStore::new(storage.clone()));
        Self::with_records(config, data_dir, records, upstream)
    }

    /// Like [`AppState::new`] with a caller-provided record store.
    pub fn with_records(
        config: Config,
        data_dir: PathBuf,
        records: Arc<dyn RecordStore>,
        upstream: Arc<dyn UpstreamIndex>,
    ) -> Self {
        let storage = Storage::from_data_dir(&data_dir, &config.storage);
        let cache = CacheManager::new(
            storage.clone(),
            records,
            upstream,
            CacheSettings::from_config(&config),
        );
        let resolver = IndexResolver::new(storage.clone(), cache.clone());
        let uploads = UploadHandler::new(storage.clone(), config.max_upload_size_bytes());

        Self {
            config: Arc::new(config),
            data_dir,
            storage,
            cache,
            resolver,
            uploads,
        }
    }

    /// Open an artifact for download: local storage first, then the cache,
    /// then a fetch from the upstream into the cache.
    pub async fn open_artifact(&self, package: &PackageName, filename: &str) -> AppResult<OpenArtifact> {
        for origin in [Origin::Local, Origin::Cache] {
            match self.storage.read_artifact(package, filename, origin).await {
                Ok(opened) => {
                    debug!(package = %package, filename = %filename, origin = %origin, "Serving stored artifact");
                    return Ok(opened);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.cache.ensure_artifact_cached(package, filename).await?;
        self.storage.read_artifact(package, filename, Origin::Cache).await
    }
}

/// Body of a successful upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub package: String,
    pub filename: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub url: String,
}

impl From<Artifact> for UploadResponse {
    fn from(artifact: Artifact) -> Self {
        Self {
            message: "Package uploaded successfully".to_string(),
            package: artifact.package.to_string(),
            filename: artifact.filename,
            size: artifact.size_bytes,
            sha256: artifact.sha256,
            url: artifact.download_url,
        }
    }
}

/// Body of a cache clear.
#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub package: String,
    pub cleared: bool,
}
