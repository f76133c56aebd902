//! Core data model of the index engine.
//!
//! [`PackageName`] is the storage key for everything else: it only exists in
//! PEP 503 normalized form, so two spellings of the same project always land
//! in the same bucket.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::pypi_utils::normalize_package_name;
use crate::validation::{validate_package_name, ValidationError, ValidationResult};

/// A validated, normalized package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Validate `raw` and store it in normalized form.
    ///
    /// ```
    /// # use pypihub_server::types::PackageName;
    /// let a = PackageName::parse("Foo_Bar").unwrap();
    /// let b = PackageName::parse("foo.bar").unwrap();
    /// assert_eq!(a, b);
    /// assert_eq!(a.as_str(), "foo-bar");
    /// ```
    pub fn parse(raw: &str) -> ValidationResult<Self> {
        validate_package_name(raw)?;
        Ok(Self(normalize_package_name(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for PackageName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> Self {
        name.0
    }
}

/// Which namespace an artifact or index entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Uploaded to this server.
    Local,
    /// Mirrored from the upstream index.
    Cache,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Cache => "cache",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One link of a simple-index page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub filename: String,
    /// Upstream entries keep the absolute upstream URL here; entries built
    /// from storage carry the server-relative artifact path.
    pub href: String,
    /// Hash fragment without the leading `#`, e.g. `sha256=ab12...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Verbatim `data-requires-python` value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    /// Verbatim `data-yanked` value; `Some("")` marks a yank without reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yanked: Option<String>,
    pub origin: Origin,
}

impl IndexEntry {
    pub fn new(filename: impl Into<String>, href: impl Into<String>, origin: Origin) -> Self {
        Self {
            filename: filename.into(),
            href: href.into(),
            hash: None,
            requires_python: None,
            yanked: None,
            origin,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// The href with its hash fragment re-attached.
    pub fn url(&self) -> String {
        match &self.hash {
            Some(hash) => format!("{}#{}", self.href, hash),
            None => self.href.clone(),
        }
    }
}

/// Characters escaped in a filename used as a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// `filename` encoded for use as a single URL path segment.
pub fn encode_path_segment(filename: &str) -> String {
    utf8_percent_encode(filename, PATH_SEGMENT).to_string()
}

/// Relative download URL of an artifact, as linked from
/// `/simple/{package}/`.
pub fn artifact_href(package: &PackageName, filename: &str) -> String {
    format!("../../packages/{package}/{}", encode_path_segment(filename))
}

/// Server-absolute download path of an artifact.
pub fn download_path(package: &PackageName, filename: &str) -> String {
    format!("/packages/{package}/{}", encode_path_segment(filename))
}

/// A stored distributable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub package: PackageName,
    pub filename: String,
    pub origin: Origin,
    pub size_bytes: u64,
    /// Hex digest from the `.meta` sidecar, when present.
    pub sha256: Option<String>,
    pub download_url: String,
    pub path: PathBuf,
}

/// Per-package upstream metadata owned by the cache manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub package: PackageName,
    pub last_refreshed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub entries: Vec<IndexEntry>,
}

impl CacheRecord {
    pub fn new(package: PackageName, entries: Vec<IndexEntry>, etag: Option<String>) -> Self {
        Self {
            package,
            last_refreshed_at: Utc::now(),
            etag,
            entries,
        }
    }

    /// Age of the record relative to `now`; records from the future count as
    /// brand new.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_refreshed_at).to_std().unwrap_or_default()
    }

    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > ttl
    }
}
