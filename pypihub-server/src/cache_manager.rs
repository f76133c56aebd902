//! Upstream mirror cache.
//!
//! [`CacheManager`] owns the lifecycle of cache records and decides when to
//! go back to the upstream index:
//!
//! - `resolve` serves a record younger than the TTL directly. Otherwise one
//!   refresh per package runs at a time (see [`SingleFlight`]); every caller
//!   arriving meanwhile gets that refresh's result.
//! - A failed or timed-out refresh falls back to the last known entries, or
//!   to whatever is already in the cache bucket, instead of failing.
//! - `ensure_artifact_cached` downloads a missing artifact once per
//!   `(package, filename)`, staging it so an interrupted download leaves
//!   nothing behind. A file missing from a fallback listing is an upstream
//!   failure, not a `NotFound`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{stream, Stream, StreamExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::record_store::RecordStore;
use crate::single_flight::SingleFlight;
use crate::storage::Storage;
use crate::types::{Artifact, CacheRecord, IndexEntry, Origin, PackageName};
use crate::upstream::{ByteStream, IndexFetch, UpstreamIndex};

/// Freshness and upstream call policy.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Maximum record age before a refresh is attempted
    pub ttl: Duration,
    /// Bound on each index fetch, on the start of a download, and on the gap
    /// between download chunks
    pub upstream_timeout: Duration,
    /// Extra index fetch attempts after a failure
    pub retries: u32,
    /// Linear backoff step; attempt `n` waits `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            upstream_timeout: Duration::from_secs(30),
            retries: 0,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: config.cache_ttl(),
            upstream_timeout: config.upstream_timeout(),
            retries: config.upstream.retries,
            retry_backoff: Duration::from_millis(config.upstream.retry_backoff_ms),
        }
    }
}

/// Upstream entries of a package, and whether they came from a refresh that
/// failed.
#[derive(Debug, Clone)]
struct Resolution {
    entries: Vec<IndexEntry>,
    /// Why the upstream could not be consulted; `entries` are then a fallback.
    upstream_error: Option<String>,
}

impl Resolution {
    fn answered(entries: Vec<IndexEntry>) -> Self {
        Self {
            entries,
            upstream_error: None,
        }
    }
}

#[derive(Clone)]
pub struct CacheManager {
    storage: Storage,
    records: Arc<dyn RecordStore>,
    upstream: Arc<dyn UpstreamIndex>,
    settings: CacheSettings,
    index_flights: SingleFlight<PackageName, Resolution>,
    artifact_flights: SingleFlight<(PackageName, String), Artifact>,
}

impl CacheManager {
    pub fn new(
        storage: Storage,
        records: Arc<dyn RecordStore>,
        upstream: Arc<dyn UpstreamIndex>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            storage,
            records,
            upstream,
            settings,
            index_flights: SingleFlight::new(),
            artifact_flights: SingleFlight::new(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Upstream entries for `package`, in upstream order.
    ///
    /// Never fails because of the upstream; see the module docs for the
    /// fallback order.
    pub async fn resolve(&self, package: &PackageName) -> AppResult<Vec<IndexEntry>> {
        Ok(self.resolve_with_status(package).await?.entries)
    }

    async fn resolve_with_status(&self, package: &PackageName) -> AppResult<Resolution> {
        if let Some(record) = self.load_record(package).await {
            if !record.is_stale(self.settings.ttl, Utc::now()) {
                debug!(package = %package, "Cache record fresh");
                return Ok(Resolution::answered(record.entries));
            }
        }

        let this = self.clone();
        let key = package.clone();
        self.index_flights
            .run(package.clone(), async move { this.refresh(&key).await })
            .await
    }

    /// Whether a cache record exists for `package`, fresh or not.
    pub async fn has_record(&self, package: &PackageName) -> bool {
        self.load_record(package).await.is_some()
    }

    async fn load_record(&self, package: &PackageName) -> Option<CacheRecord> {
        match self.records.load(package).await {
            Ok(record) => record,
            Err(e) => {
                warn!(package = %package, error = %e, "Failed to load cache record");
                None
            }
        }
    }

    async fn refresh(&self, package: &PackageName) -> AppResult<Resolution> {
        // A refresh that finished between the caller's check and this flight
        // starting has already done the work.
        let previous = self.load_record(package).await;
        if let Some(record) = &previous {
            if !record.is_stale(self.settings.ttl, Utc::now()) {
                return Ok(Resolution::answered(record.entries.clone()));
            }
        }

        let etag = previous.as_ref().and_then(|record| record.etag.as_deref());
        let outcome = match self.fetch_with_retry(package, etag).await {
            Ok(IndexFetch::Fresh { entries, etag }) => {
                Ok(CacheRecord::new(package.clone(), entries, etag))
            }
            Ok(IndexFetch::NotModified) => match previous.clone() {
                Some(mut record) => {
                    record.last_refreshed_at = Utc::now();
                    Ok(record)
                }
                None => Err(AppError::Upstream(format!(
                    "Upstream answered 304 for {package} without a cached record"
                ))),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(record) => {
                let entries = record.entries.clone();
                info!(package = %package, count = entries.len(), "Cache record refreshed");
                if let Err(e) = self.records.save(record).await {
                    warn!(package = %package, error = %e, "Failed to persist cache record");
                }
                Ok(Resolution::answered(entries))
            }
            Err(e) => {
                warn!(package = %package, error = %e, "Upstream refresh failed, serving stale data");
                Ok(Resolution {
                    entries: self.fallback(package, previous).await,
                    upstream_error: Some(e.to_string()),
                })
            }
        }
    }

    async fn fallback(&self, package: &PackageName, previous: Option<CacheRecord>) -> Vec<IndexEntry> {
        if let Some(record) = previous {
            return record.entries;
        }
        match self.storage.list_cached(package).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(package = %package, error = %e, "Failed to list cache bucket");
                Vec::new()
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        package: &PackageName,
        etag: Option<&str>,
    ) -> AppResult<IndexFetch> {
        let limit = self.settings.upstream_timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match timeout(limit, self.upstream.fetch_index(package, etag)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Upstream(format!(
                    "Upstream index fetch for {package} timed out after {limit:?}"
                ))),
            };
            match result {
                Err(e) if attempt <= self.settings.retries => {
                    let backoff = self.settings.retry_backoff * attempt;
                    warn!(package = %package, attempt, error = %e, backoff = ?backoff, "Retrying upstream index fetch");
                    sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Make sure `filename` of `package` is in cache storage, downloading it
    /// from the upstream when missing.
    pub async fn ensure_artifact_cached(
        &self,
        package: &PackageName,
        filename: &str,
    ) -> AppResult<Artifact> {
        if let Some(artifact) = self.storage.stat_artifact(package, filename, Origin::Cache).await? {
            debug!(package = %package, filename = %filename, "Artifact already cached");
            return Ok(artifact);
        }

        let this = self.clone();
        let (key_package, key_filename) = (package.clone(), filename.to_string());
        self.artifact_flights
            .run((package.clone(), filename.to_string()), async move {
                this.download_artifact(&key_package, &key_filename).await
            })
            .await
    }

    async fn download_artifact(&self, package: &PackageName, filename: &str) -> AppResult<Artifact> {
        if let Some(artifact) = self.storage.stat_artifact(package, filename, Origin::Cache).await? {
            return Ok(artifact);
        }

        // Only a listing the upstream actually returned can prove a file absent.
        let resolution = self.resolve_with_status(package).await?;
        let Some(entry) = resolution.entries.iter().find(|entry| entry.filename == filename) else {
            return Err(match resolution.upstream_error {
                Some(reason) => AppError::Upstream(format!(
                    "Cannot locate {filename} for package {package}: {reason}"
                )),
                None => AppError::NotFound(format!("No file named {filename} for package {package}")),
            });
        };
        let url = Url::parse(&entry.href)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .ok_or_else(|| {
                AppError::Upstream(format!("No upstream download URL for {filename}"))
            })?;

        let limit = self.settings.upstream_timeout;
        info!(package = %package, filename = %filename, url = %url, "Downloading artifact");
        let body = match timeout(limit, self.upstream.download(url.as_str())).await {
            Ok(body) => body?,
            Err(_) => {
                return Err(AppError::Upstream(format!(
                    "Download of {filename} did not start within {limit:?}"
                )))
            }
        };

        self.storage
            .write_cache_artifact_stream(package, filename, with_idle_timeout(body, limit))
            .await
    }

    /// Drop the cache record and cache bucket of `package`. Local artifacts
    /// are untouched. Returns whether anything was cached.
    pub async fn clear(&self, package: &PackageName) -> AppResult<bool> {
        let had_record = self.load_record(package).await.is_some();
        self.records.remove(package).await?;
        let had_bucket = self.storage.remove_cache_bucket(package).await?;
        info!(package = %package, "Cleared cache");
        Ok(had_record || had_bucket)
    }
}

/// Fail the body with an upstream error if no chunk arrives within `idle`.
fn with_idle_timeout(body: ByteStream, idle: Duration) -> impl Stream<Item = AppResult<Bytes>> + Send {
    stream::unfold(Some(body), move |state| async move {
        let mut body = state?;
        match timeout(idle, body.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(body))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(AppError::Upstream(format!("Download stalled for more than {idle:?}"))),
                None,
            )),
        }
    })
}
