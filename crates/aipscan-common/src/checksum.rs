//! Streaming SHA-256.
//!
//! METS payloads are hashed chunk by chunk while they are written to disk.

use sha2::{Digest, Sha256};

/// Incremental SHA-256 that finishes as a lowercase hex string.
#[derive(Default, Clone)]
pub struct Sha256Digest {
    hasher: Sha256,
    bytes: u64,
}

impl Sha256Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
