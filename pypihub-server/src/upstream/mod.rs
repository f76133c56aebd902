//! Client for the upstream simple index.
//!
//! [`UpstreamIndex`] is the seam the cache manager talks to. The production
//! implementation is [`UpstreamClient`] (reqwest); tests substitute a scripted
//! fake. Implementations issue exactly one request per call and never retry;
//! retry and timeout policy belongs to the caller.

pub mod parse;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::types::{IndexEntry, PackageName};

pub use parse::parse_index_page;

/// Body of an artifact download, chunk by chunk.
pub type ByteStream = BoxStream<'static, AppResult<Bytes>>;

const HTML_MEDIA_TYPES: &[&str] = &["text/html", "application/vnd.pypi.simple.v1+html"];

/// Outcome of an index fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFetch {
    /// A freshly parsed listing, in upstream order.
    Fresh {
        entries: Vec<IndexEntry>,
        etag: Option<String>,
    },
    /// The upstream confirmed the caller's ETag is still current.
    NotModified,
}

/// The upstream package index as seen by the cache manager.
#[async_trait]
pub trait UpstreamIndex: Send + Sync {
    /// Fetch and parse `{simple_url}/{package}/`. A known `etag` is sent as
    /// `If-None-Match`.
    async fn fetch_index(&self, package: &PackageName, etag: Option<&str>) -> AppResult<IndexFetch>;

    /// Start downloading an artifact from an absolute URL taken from an index
    /// entry. Errors inside the returned stream mean the body was cut short.
    async fn download(&self, url: &str) -> AppResult<ByteStream>;
}

/// Connection settings for the upstream index.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the simple index, e.g. `https://pypi.org/simple`
    pub simple_url: String,
    /// Connect timeout and bound on index requests
    pub timeout: Duration,
    /// Whether upstream lookups are enabled
    pub enabled: bool,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            simple_url: "https://pypi.org/simple".to_string(),
            timeout: Duration::from_secs(30),
            enabled: true,
            user_agent: format!("pypihub/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl UpstreamConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            simple_url: config.upstream.simple_url.clone(),
            timeout: config.upstream_timeout(),
            enabled: config.upstream.enabled,
            user_agent: config.upstream.user_agent.clone(),
        }
    }
}

/// reqwest-backed [`UpstreamIndex`].
pub struct UpstreamClient {
    client: Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    /// Build the HTTP client.
    ///
    /// Only connecting is bounded at the client level. Index requests carry a
    /// per-request timeout, while artifact bodies are bounded by the caller's
    /// idle timeout so large downloads are not cut off.
    pub fn new(config: UpstreamConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// URL of the upstream page for `package`, always with a trailing slash.
    pub fn index_url(&self, package: &PackageName) -> AppResult<Url> {
        let raw = format!("{}/{}/", self.config.simple_url.trim_end_matches('/'), package);
        Url::parse(&raw).map_err(|e| AppError::Upstream(format!("Invalid upstream URL {raw}: {e}")))
    }

    fn ensure_enabled(&self) -> AppResult<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(AppError::Upstream(
                "Upstream index lookup is disabled in configuration".to_string(),
            ))
        }
    }
}

#[async_trait]
impl UpstreamIndex for UpstreamClient {
    async fn fetch_index(&self, package: &PackageName, etag: Option<&str>) -> AppResult<IndexFetch> {
        self.ensure_enabled()?;
        let url = self.index_url(package)?;
        debug!(url = %url, etag = ?etag, "Fetching upstream simple index");

        let mut request = self
            .client
            .get(url.clone())
            .timeout(self.config.timeout)
            .header(ACCEPT, "text/html, application/vnd.pypi.simple.v1+html;q=0.9");
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| {
            warn!(package = %package, error = %e, "Failed to reach upstream index");
            AppError::Upstream(format!("Failed to reach upstream index for {package}: {e}"))
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(package = %package, "Upstream index not modified");
            return Ok(IndexFetch::NotModified);
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "Upstream index answered {status} for {package}"
            )));
        }

        if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
            let content_type = content_type.to_str().unwrap_or_default().to_ascii_lowercase();
            let media_type = content_type.split(';').next().unwrap_or_default().trim();
            if !HTML_MEDIA_TYPES.contains(&media_type) {
                return Err(AppError::Upstream(format!(
                    "Upstream index for {package} returned unsupported content type {media_type}"
                )));
            }
        }

        // Relative links resolve against the final URL, after any redirects.
        let page_url = response.url().clone();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| {
            AppError::Upstream(format!("Failed to read upstream index for {package}: {e}"))
        })?;

        let entries = parse_index_page(&body, &page_url)?;
        info!(package = %package, count = entries.len(), "Fetched upstream index");
        Ok(IndexFetch::Fresh { entries, etag })
    }

    async fn download(&self, url: &str) -> AppResult<ByteStream> {
        self.ensure_enabled()?;
        debug!(url = %url, "Downloading artifact from upstream");

        let response = self.client.get(url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Failed to reach upstream file host");
            AppError::Upstream(format!("Failed to download {url}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "Upstream answered {status} for {url}"
            )));
        }

        let url = url.to_string();
        Ok(response
            .bytes_stream()
            .map_err(move |e| AppError::Upstream(format!("Download of {url} interrupted: {e}")))
            .boxed())
    }
}
