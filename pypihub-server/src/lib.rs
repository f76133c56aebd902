//! # PyPIHub
//!
//! A local Python package index. It serves packages uploaded to it, mirrors
//! packages from an upstream simple index on demand, and presents both as a
//! single PEP 503 simple index.
//!
//! ## Key Modules
//!
//! - [`storage`]: on-disk buckets for local and cached artifacts, atomic writes
//! - [`upstream`]: upstream simple-index client and page parser
//! - [`cache_manager`]: cache records, TTL refresh, single-flight fetches
//! - [`resolver`]: merge of local and upstream listings
//! - [`upload`]: upload validation and publishing
//! - [`server`] and [`pypi`]: the HTTP surface
//! - [`config`], [`error`], [`validation`]: ambient plumbing
//!
//! Local packages always take precedence over upstream files with the same
//! filename, and a package name is only ever used in its normalized form.

pub mod cache_manager;
pub mod config;
pub mod error;
pub mod hash_utils;
pub mod html;
pub mod pypi;
pub mod pypi_utils;
pub mod record_store;
pub mod resolver;
pub mod server;
pub mod single_flight;
pub mod state;
pub mod storage;
pub mod types;
pub mod upload;
pub mod upstream;
pub mod validation;

pub use cache_manager::{CacheManager, CacheSettings};
pub use config::Config;
pub use error::{ApiErrorResponse, AppError, AppResult, ErrorCode};
pub use record_store::{DiskRecordStore, MemoryRecordStore, RecordStore};
pub use resolver::{merge_entries, IndexResolver};
pub use server::{router, run_server, run_server_with_shutdown};
pub use state::AppState;
pub use storage::{OpenArtifact, Storage};
pub use types::{Artifact, CacheRecord, IndexEntry, Origin, PackageName};
pub use upload::{UploadHandler, UploadRequest};
pub use upstream::{
    parse_index_page, ByteStream, IndexFetch, UpstreamClient, UpstreamConfig, UpstreamIndex,
};
pub use validation::{ValidationError, ValidationResult};
