//! Common test utilities and helpers
//!
//! [`FakeUpstream`] stands in for the upstream index: it counts calls, can be
//! slowed down, switched to failing, or told to cut downloads short.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use tempfile::TempDir;

use pypihub_server::{
    AppError, AppResult, AppState, ByteStream, CacheManager, CacheSettings, Config, IndexEntry,
    IndexFetch, MemoryRecordStore, Origin, PackageName, RecordStore, Storage, UpstreamIndex,
};

pub const FILES_HOST: &str = "https://files.example";

#[derive(Default)]
pub struct FakeUpstream {
    pages: Mutex<HashMap<String, Vec<IndexEntry>>>,
    files: Mutex<HashMap<String, Bytes>>,
    index_calls: AtomicUsize,
    download_calls: AtomicUsize,
    delay: Mutex<Duration>,
    failing: AtomicBool,
    truncated: AtomicBool,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `files` for `package`, in the given order.
    pub fn publish(&self, package: &str, files: &[(&str, &str)]) {
        let package = PackageName::parse(package).expect("valid package name");
        let mut entries = Vec::new();
        for (filename, content) in files {
            let url = file_url(package.as_str(), filename);
            self.files
                .lock()
                .unwrap()
                .insert(url.clone(), Bytes::copy_from_slice(content.as_bytes()));
            entries.push(IndexEntry::new(*filename, url, Origin::Cache));
        }
        self.pages
            .lock()
            .unwrap()
            .insert(package.as_str().to_string(), entries);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Downloads send half the bytes, then fail.
    pub fn set_truncated(&self, truncated: bool) {
        self.truncated.store(truncated, Ordering::SeqCst);
    }

    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_failing(&self) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AppError::Upstream("fake upstream is down".to_string()))
        } else {
            Ok(())
        }
    }
}

pub fn file_url(package: &str, filename: &str) -> String {
    format!("{FILES_HOST}/{package}/{filename}")
}

#[async_trait]
impl UpstreamIndex for FakeUpstream {
    async fn fetch_index(&self, package: &PackageName, _etag: Option<&str>) -> AppResult<IndexFetch> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_failing()?;

        let entries = self.pages.lock().unwrap().get(package.as_str()).cloned();
        match entries {
            Some(entries) => Ok(IndexFetch::Fresh { entries, etag: None }),
            None => Err(AppError::Upstream(format!("404 for {package}"))),
        }
    }

    async fn download(&self, url: &str) -> AppResult<ByteStream> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_failing()?;

        let content = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::Upstream(format!("404 for {url}")))?;

        if self.truncated.load(Ordering::SeqCst) {
            let half = content.slice(..content.len() / 2);
            return Ok(stream::iter(vec![
                Ok(half),
                Err(AppError::Upstream("connection reset mid-body".to_string())),
            ])
            .boxed());
        }

        let chunks: Vec<AppResult<Bytes>> = content
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

pub fn package(raw: &str) -> PackageName {
    PackageName::parse(raw).expect("valid package name")
}

pub fn storage_in(dir: &Path) -> Storage {
    Storage::new(dir.join("local"), dir.join("cache"))
}

/// Core components over a temp dir, without the HTTP layer.
pub struct CoreSetup {
    pub temp_dir: TempDir,
    pub upstream: Arc<FakeUpstream>,
    pub storage: Storage,
    pub cache: CacheManager,
}

pub fn create_core_setup(settings: CacheSettings) -> CoreSetup {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let upstream = FakeUpstream::new();
    let storage = storage_in(temp_dir.path());
    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let cache = CacheManager::new(storage.clone(), records, upstream.clone(), settings);
    CoreSetup {
        temp_dir,
        upstream,
        storage,
        cache,
    }
}

pub fn fast_settings() -> CacheSettings {
    CacheSettings {
        ttl: Duration::from_secs(600),
        upstream_timeout: Duration::from_secs(5),
        retries: 0,
        retry_backoff: Duration::from_millis(10),
    }
}

/// Full application state over a temp dir and a fake upstream.
pub struct TestSetup {
    pub temp_dir: TempDir,
    pub upstream: Arc<FakeUpstream>,
    pub app_state: Arc<AppState>,
}

pub fn create_test_setup() -> TestSetup {
    create_test_setup_with(Config::default())
}

pub fn create_test_setup_with(config: Config) -> TestSetup {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let upstream = FakeUpstream::new();
    let app_state = Arc::new(AppState::new(
        config,
        temp_dir.path().to_path_buf(),
        upstream.clone(),
    ));
    TestSetup {
        temp_dir,
        upstream,
        app_state,
    }
}
