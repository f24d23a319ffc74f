//! Engine configuration.
//!
//! All structs implement `Default` and `serde::Deserialize`, so hosts can
//! build them in code or load them from any serde format. Missing fields
//! take their defaults.

use serde::Deserialize;

use dynastore_core::escape::{validate_reserved_words, RESERVED_WORDS};
use dynastore_core::{StoreError, StoreResult};

/// Default blob chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub registry: RegistryConfig,
    pub blob: BlobConfig,
    pub document: DocumentConfig,
}

/// Type registry settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Cached types kept before clean entries are evicted oldest-first.
    /// 0 means unbounded.
    pub max_cached_types: usize,
}

/// Chunked blob store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Bytes per stored chunk. Must be positive.
    pub chunk_size: usize,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Document store settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Decoded documents cached in process. 0 disables the cache.
    pub cache_capacity: usize,
}

impl EngineConfig {
    /// Checks the settings and the static reserved-word list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedSchema`] if `blob.chunk_size` is zero
    /// or a reserved word ends in `_`.
    pub fn validate(&self) -> StoreResult<()> {
        if self.blob.chunk_size == 0 {
            return Err(StoreError::MalformedSchema {
                type_name: "config".to_string(),
                reason: "blob.chunk_size must be positive".to_string(),
            });
        }
        validate_reserved_words(RESERVED_WORDS)
    }
}
