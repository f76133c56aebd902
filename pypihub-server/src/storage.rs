//! On-disk layout of local and cached artifacts.
//!
//! ```text
//! {data}/local/{package}/{filename}        uploaded artifacts
//! {data}/local/{package}/{filename}.meta   sha256 hex digest
//! {data}/cache/{package}/{filename}        mirrored artifacts
//! {data}/cache/{package}/{filename}.meta
//! {data}/cache/{package}/.record.json      cache record
//! ```
//!
//! Every write is staged to a hidden `.{filename}.{uuid}.part` file inside the
//! target bucket and only published once the whole payload has been written
//! and synced. Readers never see a partially-written artifact; a crash leaves
//! at most an orphaned temp file, which listings ignore.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{AppError, AppResult};
use crate::hash_utils::{sha256_fragment, StreamingSha256};
use crate::types::{artifact_href, download_path, Artifact, CacheRecord, IndexEntry, Origin, PackageName};
use crate::validation::validate_artifact_filename;

const META_SUFFIX: &str = ".meta";
const RECORD_FILE: &str = ".record.json";

/// Owner of every artifact path under the local and cache roots.
#[derive(Debug, Clone)]
pub struct Storage {
    local_root: PathBuf,
    cache_root: PathBuf,
}

/// An artifact opened for reading.
#[derive(Debug)]
pub struct OpenArtifact {
    pub artifact: Artifact,
    pub file: fs::File,
}

struct Staged {
    path: PathBuf,
    sha256: String,
    size: u64,
}

impl Storage {
    pub fn new(local_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            cache_root: cache_root.into(),
        }
    }

    pub fn from_data_dir(data_dir: &Path, config: &StorageConfig) -> Self {
        Self::new(
            data_dir.join(&config.local_dir),
            data_dir.join(&config.cache_dir),
        )
    }

    /// Create both roots.
    pub async fn init(&self) -> AppResult<()> {
        fs::create_dir_all(&self.local_root).await?;
        fs::create_dir_all(&self.cache_root).await?;
        debug!(
            local = %self.local_root.display(),
            cache = %self.cache_root.display(),
            "Storage roots ready"
        );
        Ok(())
    }

    pub fn root(&self, origin: Origin) -> &Path {
        match origin {
            Origin::Local => &self.local_root,
            Origin::Cache => &self.cache_root,
        }
    }

    pub fn bucket(&self, package: &PackageName, origin: Origin) -> PathBuf {
        self.root(origin).join(package.as_str())
    }

    fn artifact_path(
        &self,
        package: &PackageName,
        filename: &str,
        origin: Origin,
    ) -> AppResult<PathBuf> {
        validate_artifact_filename(filename)?;
        if filename.ends_with(META_SUFFIX) {
            return Err(AppError::InvalidInput(format!(
                "{filename} is reserved for artifact metadata"
            )));
        }
        Ok(self.bucket(package, origin).join(filename))
    }

    pub async fn bucket_exists(&self, package: &PackageName, origin: Origin) -> bool {
        fs::metadata(self.bucket(package, origin))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Uploaded artifacts of `package`, sorted by filename.
    pub async fn list_local(&self, package: &PackageName) -> AppResult<Vec<IndexEntry>> {
        self.list_bucket(package, Origin::Local).await
    }

    /// Mirrored artifacts of `package` that are fully present on disk.
    pub async fn list_cached(&self, package: &PackageName) -> AppResult<Vec<IndexEntry>> {
        self.list_bucket(package, Origin::Cache).await
    }

    async fn list_bucket(&self, package: &PackageName, origin: Origin) -> AppResult<Vec<IndexEntry>> {
        let dir = self.bucket(package, origin);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(dir_entry) = read_dir.next_entry().await? {
            let Ok(filename) = dir_entry.file_name().into_string() else {
                continue;
            };
            if filename.starts_with('.') || filename.ends_with(META_SUFFIX) {
                continue;
            }
            if !dir_entry.file_type().await?.is_file() {
                continue;
            }

            let mut entry = IndexEntry::new(filename.as_str(), artifact_href(package, &filename), origin);
            if let Some(hex) = read_meta(&dir, &filename).await {
                entry = entry.with_hash(sha256_fragment(&hex));
            }
            entries.push(entry);
        }

        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        debug!(package = %package, origin = %origin, count = entries.len(), "Listed bucket");
        Ok(entries)
    }

    /// Every normalized package name with a local or cache bucket.
    pub async fn list_packages(&self) -> AppResult<Vec<PackageName>> {
        let mut names = BTreeSet::new();
        for root in [&self.local_root, &self.cache_root] {
            let mut read_dir = match fs::read_dir(root).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(dir_entry) = read_dir.next_entry().await? {
                if !dir_entry.file_type().await?.is_dir() {
                    continue;
                }
                let Ok(dir_name) = dir_entry.file_name().into_string() else {
                    continue;
                };
                match PackageName::parse(&dir_name) {
                    Ok(name) if name.as_str() == dir_name => {
                        names.insert(name);
                    }
                    _ => debug!(dir = %dir_name, "Skipping non-package directory"),
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Metadata of a stored artifact, `None` when it is not on disk.
    pub async fn stat_artifact(
        &self,
        package: &PackageName,
        filename: &str,
        origin: Origin,
    ) -> AppResult<Option<Artifact>> {
        let path = self.artifact_path(package, filename, origin)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sha256 = read_meta(&self.bucket(package, origin), filename).await;

        Ok(Some(Artifact {
            package: package.clone(),
            filename: filename.to_string(),
            origin,
            size_bytes: metadata.len(),
            sha256,
            download_url: download_path(package, filename),
            path,
        }))
    }

    /// Open an artifact for streaming.
    pub async fn read_artifact(
        &self,
        package: &PackageName,
        filename: &str,
        origin: Origin,
    ) -> AppResult<OpenArtifact> {
        let not_found = || {
            AppError::NotFound(format!(
                "Artifact {filename} not found in {origin} storage for package {package}"
            ))
        };
        let artifact = self
            .stat_artifact(package, filename, origin)
            .await?
            .ok_or_else(not_found)?;

        // The file can disappear between stat and open when the cache is cleared.
        let file = match fs::File::open(&artifact.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        Ok(OpenArtifact { artifact, file })
    }

    /// Publish an uploaded artifact. Existing filenames are never replaced.
    pub async fn write_local_artifact(
        &self,
        package: &PackageName,
        filename: &str,
        content: &[u8],
    ) -> AppResult<Artifact> {
        let path = self.artifact_path(package, filename, Origin::Local)?;
        let conflict = || {
            AppError::Conflict(format!(
                "File {filename} already exists for package {package}"
            ))
        };
        if fs::try_exists(&path).await? {
            return Err(conflict());
        }

        let dir = self.bucket(package, Origin::Local);
        let staged = stage(&dir, filename, single_chunk(content)).await?;

        // hard_link refuses to replace an existing file, so exactly one of
        // several concurrent uploads of the same filename wins.
        let published = fs::hard_link(&staged.path, &path).await;
        remove_quietly(&staged.path).await;
        match published {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(conflict()),
            Err(e) => return Err(e.into()),
        }

        write_meta(&dir, filename, &staged.sha256).await?;
        info!(package = %package, filename = %filename, size = staged.size, "Stored local artifact");
        Ok(self.published(package, filename, Origin::Local, staged, path))
    }

    /// Store a mirrored artifact from an in-memory payload.
    pub async fn write_cache_artifact(
        &self,
        package: &PackageName,
        filename: &str,
        content: &[u8],
    ) -> AppResult<Artifact> {
        self.write_cache_artifact_stream(package, filename, single_chunk(content))
            .await
    }

    /// Store a mirrored artifact from a byte stream.
    ///
    /// If the stream yields an error, the staged file is removed and the
    /// error is returned; nothing becomes visible under `filename`.
    pub async fn write_cache_artifact_stream<S>(
        &self,
        package: &PackageName,
        filename: &str,
        body: S,
    ) -> AppResult<Artifact>
    where
        S: Stream<Item = AppResult<Bytes>> + Send,
    {
        let path = self.artifact_path(package, filename, Origin::Cache)?;
        let dir = self.bucket(package, Origin::Cache);
        let staged = stage(&dir, filename, body).await?;

        if let Err(e) = fs::rename(&staged.path, &path).await {
            remove_quietly(&staged.path).await;
            return Err(e.into());
        }

        write_meta(&dir, filename, &staged.sha256).await?;
        info!(package = %package, filename = %filename, size = staged.size, "Stored cached artifact");
        Ok(self.published(package, filename, Origin::Cache, staged, path))
    }

    fn published(
        &self,
        package: &PackageName,
        filename: &str,
        origin: Origin,
        staged: Staged,
        path: PathBuf,
    ) -> Artifact {
        Artifact {
            package: package.clone(),
            filename: filename.to_string(),
            origin,
            size_bytes: staged.size,
            sha256: Some(staged.sha256),
            download_url: download_path(package, filename),
            path,
        }
    }

    fn record_path(&self, package: &PackageName) -> PathBuf {
        self.bucket(package, Origin::Cache).join(RECORD_FILE)
    }

    /// Read the persisted cache record. A corrupt record counts as absent.
    pub async fn load_record(&self, package: &PackageName) -> AppResult<Option<CacheRecord>> {
        let path = self.record_path(package);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<CacheRecord>(&raw) {
            Ok(record) if &record.package == package => Ok(Some(record)),
            Ok(record) => {
                warn!(package = %package, found = %record.package, "Cache record belongs to another package, ignoring");
                Ok(None)
            }
            Err(e) => {
                warn!(package = %package, error = %e, "Corrupt cache record, ignoring");
                Ok(None)
            }
        }
    }

    pub async fn save_record(&self, record: &CacheRecord) -> AppResult<()> {
        let dir = self.bucket(&record.package, Origin::Cache);
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&dir, RECORD_FILE, &json).await?;
        debug!(package = %record.package, entries = record.entries.len(), "Saved cache record");
        Ok(())
    }

    pub async fn remove_record(&self, package: &PackageName) -> AppResult<()> {
        match fs::remove_file(self.record_path(package)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the cache bucket of `package`, record included. Returns whether
    /// anything was removed.
    pub async fn remove_cache_bucket(&self, package: &PackageName) -> AppResult<bool> {
        match fs::remove_dir_all(self.bucket(package, Origin::Cache)).await {
            Ok(()) => {
                info!(package = %package, "Removed cache bucket");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn single_chunk(content: &[u8]) -> impl Stream<Item = AppResult<Bytes>> + Send {
    stream::once(futures_util::future::ready(Ok(Bytes::copy_from_slice(content))))
}

fn temp_name(filename: &str) -> String {
    format!(".{filename}.{}.part", Uuid::new_v4().simple())
}

fn meta_name(filename: &str) -> String {
    format!("{filename}{META_SUFFIX}")
}

async fn read_meta(dir: &Path, filename: &str) -> Option<String> {
    match fs::read_to_string(dir.join(meta_name(filename))).await {
        Ok(hex) => {
            let hex = hex.trim();
            (!hex.is_empty()).then(|| hex.to_string())
        }
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!(filename = %filename, error = %e, "Unreadable meta sidecar");
            }
            None
        }
    }
}

async fn write_meta(dir: &Path, filename: &str, sha256: &str) -> AppResult<()> {
    write_atomic(dir, &meta_name(filename), sha256.as_bytes()).await
}

async fn write_atomic(dir: &Path, filename: &str, content: &[u8]) -> AppResult<()> {
    let staged = stage(dir, filename, single_chunk(content)).await?;
    if let Err(e) = fs::rename(&staged.path, dir.join(filename)).await {
        remove_quietly(&staged.path).await;
        return Err(e.into());
    }
    Ok(())
}

/// Write `body` to a fresh temp file in `dir`, hashing as it goes.
async fn stage<S>(dir: &Path, filename: &str, body: S) -> AppResult<Staged>
where
    S: Stream<Item = AppResult<Bytes>> + Send,
{
    fs::create_dir_all(dir).await?;
    let path = dir.join(temp_name(filename));
    match write_stream(&path, body).await {
        Ok((sha256, size)) => Ok(Staged { path, sha256, size }),
        Err(e) => {
            remove_quietly(&path).await;
            Err(e)
        }
    }
}

async fn write_stream<S>(path: &Path, body: S) -> AppResult<(String, u64)>
where
    S: Stream<Item = AppResult<Bytes>> + Send,
{
    tokio::pin!(body);
    let mut file = fs::File::create(path).await?;
    let mut hasher = StreamingSha256::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    let size = hasher.len();
    Ok((hasher.finish(), size))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temp file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_utils::sha256_hash;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> Storage {
        Storage::new(dir.path().join("local"), dir.path().join("cache"))
    }

    fn name(raw: &str) -> PackageName {
        PackageName::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_missing_bucket_lists_empty() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        assert!(storage.list_local(&name("foo")).await.unwrap().is_empty());
        assert!(storage.list_cached(&name("foo")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_write_is_append_only() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let foo = name("foo");

        let artifact = storage
            .write_local_artifact(&foo, "foo-1.0.0.whl", b"first")
            .await
            .unwrap();
        assert_eq!(artifact.size_bytes, 5);
        assert_eq!(artifact.sha256.as_deref(), Some(sha256_hash(b"first").as_str()));
        assert_eq!(artifact.download_url, "/packages/foo/foo-1.0.0.whl");

        let err = storage
            .write_local_artifact(&foo, "foo-1.0.0.whl", b"second")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_listing_carries_hash_and_skips_sidecars() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let foo = name("foo");
        storage.write_local_artifact(&foo, "foo-2.0.tar.gz", b"b").await.unwrap();
        storage.write_local_artifact(&foo, "foo-1.0.tar.gz", b"a").await.unwrap();
        std::fs::write(storage.bucket(&foo, Origin::Local).join(".foo-3.0.tar.gz.x.part"), b"partial")
            .unwrap();

        let entries = storage.list_local(&foo).await.unwrap();
        let filenames: Vec<_> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(filenames, ["foo-1.0.tar.gz", "foo-2.0.tar.gz"]);
        assert_eq!(entries[0].href, "../../packages/foo/foo-1.0.tar.gz");
        assert_eq!(entries[0].hash, Some(format!("sha256={}", sha256_hash(b"a"))));
        assert_eq!(entries[0].origin, Origin::Local);
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing_visible() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let foo = name("foo");
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"half of the")),
            Err(AppError::Upstream("connection reset".into())),
        ]);

        let err = storage
            .write_cache_artifact_stream(&foo, "foo-1.0.whl", body)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));

        assert!(storage.stat_artifact(&foo, "foo-1.0.whl", Origin::Cache).await.unwrap().is_none());
        let read = storage.read_artifact(&foo, "foo-1.0.whl", Origin::Cache).await;
        assert!(matches!(read, Err(AppError::NotFound(_))));
        let leftovers = std::fs::read_dir(storage.bucket(&foo, Origin::Cache)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_cache_write_then_read() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let foo = name("Foo");
        storage.write_cache_artifact(&foo, "Foo-1.0.whl", b"wheel").await.unwrap();

        let opened = storage.read_artifact(&foo, "Foo-1.0.whl", Origin::Cache).await.unwrap();
        assert_eq!(opened.artifact.origin, Origin::Cache);
        assert_eq!(opened.artifact.size_bytes, 5);
        assert!(opened.artifact.path.starts_with(dir.path().join("cache").join("foo")));
    }

    #[tokio::test]
    async fn test_traversal_is_rejected_before_io() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let err = storage
            .write_local_artifact(&name("foo"), "../escape.whl", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(!dir.path().join("local").join("escape.whl").exists());
    }

    #[tokio::test]
    async fn test_record_round_trip_and_clear() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let foo = name("foo");
        assert!(storage.load_record(&foo).await.unwrap().is_none());

        let entry = IndexEntry::new("foo-1.0.whl", "https://files.example/foo-1.0.whl", Origin::Cache);
        let record = CacheRecord::new(foo.clone(), vec![entry], Some("\"v1\"".into()));
        storage.save_record(&record).await.unwrap();
        assert_eq!(storage.load_record(&foo).await.unwrap(), Some(record));
        assert!(storage.list_cached(&foo).await.unwrap().is_empty());

        assert!(storage.remove_cache_bucket(&foo).await.unwrap());
        assert!(!storage.remove_cache_bucket(&foo).await.unwrap());
        assert!(storage.load_record(&foo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_counts_as_absent() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let foo = name("foo");
        let bucket = storage.bucket(&foo, Origin::Cache);
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join(RECORD_FILE), b"{not json").unwrap();
        assert!(storage.load_record(&foo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_packages_merges_roots() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.init().await.unwrap();
        storage.write_local_artifact(&name("beta"), "beta-1.0.whl", b"b").await.unwrap();
        storage.write_cache_artifact(&name("alpha"), "alpha-1.0.whl", b"a").await.unwrap();
        storage.write_cache_artifact(&name("beta"), "beta-0.9.whl", b"b").await.unwrap();
        std::fs::create_dir_all(dir.path().join("local").join("Not_Normalized")).unwrap();

        let names: Vec<_> = storage.list_packages().await.unwrap();
        let names: Vec<_> = names.iter().map(PackageName::as_str).collect();
        assert_eq!(names, ["alpha", "beta"]);
    }
}
