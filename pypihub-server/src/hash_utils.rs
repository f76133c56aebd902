//! Hashing helpers for artifact sidecars and index fragments

use sha2::{Digest, Sha256};

/// Calculate the SHA256 hash of data as a lowercase hex string.
///
/// # Examples
///
/// ```
/// # use pypihub_server::hash_utils::sha256_hash;
/// let hash = sha256_hash(b"hello world");
/// assert_eq!(hash.len(), 64);
/// ```
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Incremental SHA256 over a streamed payload.
#[derive(Default)]
pub struct StreamingSha256 {
    hasher: Sha256,
    len: u64,
}

impl StreamingSha256 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// Index-page hash fragment for a hex digest.
pub fn sha256_fragment(hex: &str) -> String {
    format!("sha256={hex}")
}
