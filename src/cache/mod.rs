//! Persistent, content-addressed OCR result cache.
//!
//! A single `entries(key, val, exp, updated)` table, served either from
//! a durable SQLite file or a single-connection in-memory database. See
//! [`sqlite::SqliteCache`] for the implementation; this module only
//! carries the trait both backends satisfy and the shared error type.

pub mod codec;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use sqlite::SqliteCache;

use crate::hash::PageHash;

/// Errors the cache can raise. Under `ignore_errors` these are never
/// allowed to reach the caller: [`sqlite::SqliteCache`] downgrades them
/// to a miss-on-read / no-op-on-write at the call site instead.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("corrupt cache value for key {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: codec::CodecError,
    },
}

/// Contract implemented by every cache backend.
///
/// All operations take already-validated [`PageHash`] keys, so key
/// canonicalization is enforced by the type rather than by convention.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn has(&self, key: &PageHash) -> Result<bool, CacheError>;

    async fn has_many(&self, keys: &[PageHash]) -> Result<Vec<bool>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.has(key).await?);
        }
        Ok(out)
    }

    async fn get(&self, key: &PageHash) -> Result<Option<Value>, CacheError>;

    async fn get_many(&self, keys: &[PageHash]) -> Result<Vec<Option<Value>>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Upsert. `ttl` of `None`/`Some(0)` means "never expire". Triggers
    /// an eviction sweep.
    async fn set(&self, key: &PageHash, value: Value, ttl: Option<u64>) -> Result<(), CacheError>;

    async fn set_many(
        &self,
        entries: Vec<(PageHash, Value)>,
        ttl: Option<u64>,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Like [`Cache::set`] but fails if the key is already present.
    async fn add(&self, key: &PageHash, value: Value, ttl: Option<u64>) -> Result<bool, CacheError>;

    /// Returns true if a row was removed.
    async fn delete(&self, key: &PageHash) -> Result<bool, CacheError>;

    async fn delete_many(&self, keys: &[PageHash]) -> Result<u64, CacheError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), CacheError>;
}
