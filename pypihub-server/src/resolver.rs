//! Merged simple-index listings.
//!
//! The resolver holds no state of its own: every call reads the local bucket
//! afresh and asks the cache manager for upstream entries, so a fresh upload
//! is visible on the very next listing.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::cache_manager::CacheManager;
use crate::error::AppResult;
use crate::storage::Storage;
use crate::types::{IndexEntry, Origin, PackageName};
use crate::validation::validate_artifact_filename;

#[derive(Clone)]
pub struct IndexResolver {
    storage: Storage,
    cache: CacheManager,
}

impl IndexResolver {
    pub fn new(storage: Storage, cache: CacheManager) -> Self {
        Self { storage, cache }
    }

    /// Local and upstream entries of `package`, merged.
    ///
    /// An upstream failure degrades to a local-only listing; a local storage
    /// failure is an error.
    pub async fn build_simple_index_page(&self, package: &PackageName) -> AppResult<Vec<IndexEntry>> {
        let (local, cached) = tokio::join!(self.storage.list_local(package), self.cache.resolve(package));
        let local = local?;
        let cached = cached.unwrap_or_else(|e| {
            warn!(package = %package, error = %e, "Upstream entries unavailable, listing local files only");
            Vec::new()
        });

        let merged = merge_entries(local, cached);
        debug!(package = %package, count = merged.len(), "Built simple index");
        Ok(merged)
    }

    /// Whether anything at all is known about `package`: a local or cache
    /// bucket, or a cache record.
    pub async fn is_known(&self, package: &PackageName) -> bool {
        self.storage.bucket_exists(package, Origin::Local).await
            || self.storage.bucket_exists(package, Origin::Cache).await
            || self.cache.has_record(package).await
    }
}

/// Union of `local` and `cached` by filename.
///
/// Cache order is kept. A local entry sharing a cache entry's filename takes
/// that entry's position; remaining local entries follow in filename order.
/// Repeated cache filenames keep their first occurrence, and cache entries
/// whose filename could not be stored are dropped.
pub fn merge_entries(local: Vec<IndexEntry>, cached: Vec<IndexEntry>) -> Vec<IndexEntry> {
    let mut local: BTreeMap<String, IndexEntry> = local
        .into_iter()
        .map(|entry| (entry.filename.clone(), entry))
        .collect();
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(local.len() + cached.len());

    for entry in cached {
        if validate_artifact_filename(&entry.filename).is_err() {
            debug!(filename = %entry.filename, "Dropping upstream entry with unusable filename");
            continue;
        }
        if !seen.insert(entry.filename.clone()) {
            continue;
        }
        merged.push(local.remove(&entry.filename).unwrap_or(entry));
    }

    merged.extend(local.into_values());
    merged
}
