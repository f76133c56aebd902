//! Cache record persistence.
//!
//! The cache manager owns record lifecycle but not where records live. A
//! [`RecordStore`] is handed to it at construction, so tests can run against
//! a plain in-memory table.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::AppResult;
use crate::storage::Storage;
use crate::types::{CacheRecord, PackageName};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, package: &PackageName) -> AppResult<Option<CacheRecord>>;
    async fn save(&self, record: CacheRecord) -> AppResult<()>;
    async fn remove(&self, package: &PackageName) -> AppResult<()>;
}

/// Process-lifetime record table.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<PackageName, CacheRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, package: &PackageName) -> AppResult<Option<CacheRecord>> {
        Ok(self.records.get(package).map(|record| record.value().clone()))
    }

    async fn save(&self, record: CacheRecord) -> AppResult<()> {
        self.records.insert(record.package.clone(), record);
        Ok(())
    }

    async fn remove(&self, package: &PackageName) -> AppResult<()> {
        self.records.remove(package);
        Ok(())
    }
}

/// Write-through store keeping `.record.json` in each cache bucket, so cache
/// state survives a restart.
pub struct DiskRecordStore {
    storage: Storage,
    memo: MemoryRecordStore,
}

impl DiskRecordStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            memo: MemoryRecordStore::new(),
        }
    }
}

#[async_trait]
impl RecordStore for DiskRecordStore {
    async fn load(&self, package: &PackageName) -> AppResult<Option<CacheRecord>> {
        if let Some(record) = self.memo.load(package).await? {
            return Ok(Some(record));
        }
        let record = self.storage.load_record(package).await?;
        if let Some(record) = &record {
            debug!(package = %package, "Loaded cache record from disk");
            self.memo.save(record.clone()).await?;
        }
        Ok(record)
    }

    /// The in-memory copy is updated even if persisting fails.
    async fn save(&self, record: CacheRecord) -> AppResult<()> {
        self.memo.save(record.clone()).await?;
        self.storage.save_record(&record).await
    }

    async fn remove(&self, package: &PackageName) -> AppResult<()> {
        self.memo.remove(package).await?;
        self.storage.remove_record(package).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IndexEntry, Origin};
    use tempfile::TempDir;

    fn record(name: &str) -> CacheRecord {
        let package = PackageName::parse(name).unwrap();
        let entry = IndexEntry::new(
            format!("{name}-1.0.whl"),
            format!("https://files.example/{name}-1.0.whl"),
            Origin::Cache,
        );
        CacheRecord::new(package, vec![entry], None)
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryRecordStore::new();
        let foo = record("foo");
        store.save(foo.clone()).await.unwrap();
        assert_eq!(store.load(&foo.package).await.unwrap(), Some(foo.clone()));
        store.remove(&foo.package).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_disk_store_survives_restart() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("local"), dir.path().join("cache"));
        let foo = record("foo");

        DiskRecordStore::new(storage.clone()).save(foo.clone()).await.unwrap();

        let reopened = DiskRecordStore::new(storage.clone());
        assert_eq!(reopened.load(&foo.package).await.unwrap(), Some(foo.clone()));

        reopened.remove(&foo.package).await.unwrap();
        assert!(reopened.load(&foo.package).await.unwrap().is_none());
        assert!(storage.load_record(&foo.package).await.unwrap().is_none());
    }
}
