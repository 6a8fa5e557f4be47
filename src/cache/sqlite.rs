//! SQLite-backed implementation of [`super::Cache`].
//!
//! Mirrors the pooling idiom this codebase already uses for its
//! relational layer (`PRAGMA journal_mode=WAL`, `synchronous=NORMAL`,
//! `cache_size`, `temp_store=MEMORY`) but against the much smaller
//! single-table schema this cache actually needs.
//!
//! The in-memory variant (`:memory:`) uses a pool capped at one
//! connection. sqlx serializes every acquire behind that single
//! connection, so concurrent callers never race inside SQLite itself —
//! this is what makes the in-memory backend safe to use from multiple
//! executor workers without a dedicated lock.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

use super::{codec, Cache, CacheError};
use crate::hash::PageHash;

/// Tuning knobs carried over from `OCR_CACHE_*` configuration keys.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Entry count eviction threshold. 0 disables count-based eviction.
    pub threshold: u64,
    /// Byte-size eviction ceiling. 0 disables size-based eviction.
    pub max_size: u64,
    /// Default TTL in seconds applied when a caller doesn't specify one.
    pub default_timeout: u64,
    /// Degrade backend errors to miss/no-op instead of propagating.
    pub ignore_errors: bool,
}

pub struct SqliteCache {
    pool: SqlitePool,
    limits: CacheLimits,
}

impl SqliteCache {
    /// Open a durable, file-backed cache at `path`.
    pub async fn open_file(path: &str, limits: CacheLimits) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(60))
            .connect_with(options)
            .await?;

        Self::init(&pool, true).await?;
        Ok(Self { pool, limits })
    }

    /// Open a single-connection, in-memory cache.
    pub async fn open_memory(limits: CacheLimits) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(60))
            .idle_timeout(None)
            .connect_with(options)
            .await?;

        Self::init(&pool, false).await?;
        Ok(Self { pool, limits })
    }

    async fn init(pool: &SqlitePool, enable_wal: bool) -> Result<(), CacheError> {
        if enable_wal {
            sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
        }
        sqlx::query("PRAGMA synchronous=NORMAL").execute(pool).await?;
        sqlx::query("PRAGMA cache_size=-16000").execute(pool).await?;
        sqlx::query("PRAGMA temp_store=MEMORY").execute(pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                val BLOB NOT NULL,
                exp REAL NOT NULL DEFAULT 0,
                updated REAL NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS entries_updated ON entries(updated)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn degrade_read<T>(&self, result: Result<T, CacheError>, default: T) -> Result<T, CacheError> {
        match result {
            Err(e) if self.limits.ignore_errors => {
                warn!(error = %e, "cache read failed, degrading to miss");
                Ok(default)
            }
            other => other,
        }
    }

    fn degrade_write(&self, result: Result<(), CacheError>) -> Result<(), CacheError> {
        match result {
            Err(e) if self.limits.ignore_errors => {
                warn!(error = %e, "cache write failed, ignoring");
                Ok(())
            }
            other => other,
        }
    }

    async fn has_inner(&self, key: &PageHash) -> Result<bool, CacheError> {
        let now = now_secs();
        let row = sqlx::query(
            "SELECT 1 FROM entries WHERE key = ? AND (exp <= 0 OR exp > ?)",
        )
        .bind(key.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_inner(&self, key: &PageHash) -> Result<Option<Value>, CacheError> {
        let now = now_secs();
        let row = sqlx::query(
            "SELECT val FROM entries WHERE key = ? AND (exp <= 0 OR exp > ?)",
        )
        .bind(key.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let blob: Vec<u8> = row.try_get("val")?;
                let value = codec::decode(&blob).map_err(|source| CacheError::Corrupt {
                    key: key.as_str().to_string(),
                    source,
                })?;
                Ok(Some(value))
            }
        }
    }

    async fn set_inner(
        &self,
        key: &PageHash,
        value: &Value,
        ttl: Option<u64>,
    ) -> Result<(), CacheError> {
        let blob = codec::encode(value).map_err(|source| CacheError::Corrupt {
            key: key.as_str().to_string(),
            source,
        })?;
        let ttl = ttl.unwrap_or(self.limits.default_timeout);
        let now = now_secs();
        let exp = if ttl == 0 { 0.0 } else { now + ttl as f64 };

        sqlx::query(
            "INSERT INTO entries (key, val, exp, updated) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET val = excluded.val, exp = excluded.exp, updated = excluded.updated",
        )
        .bind(key.as_str())
        .bind(blob)
        .bind(exp)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.evict().await
    }

    async fn has_many_inner(&self, keys: &[PageHash]) -> Result<Vec<bool>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let now = now_secs();
        let placeholders = vec!["?"; keys.len()].join(",");
        let sql = format!(
            "SELECT key FROM entries WHERE key IN ({placeholders}) AND (exp <= 0 OR exp > ?)"
        );
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key.as_str());
        }
        query = query.bind(now);
        let rows = query.fetch_all(&self.pool).await?;

        let present: std::collections::HashSet<String> = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("key"))
            .collect::<Result<_, _>>()?;

        Ok(keys.iter().map(|k| present.contains(k.as_str())).collect())
    }

    async fn get_many_inner(&self, keys: &[PageHash]) -> Result<Vec<Option<Value>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let now = now_secs();
        let placeholders = vec!["?"; keys.len()].join(",");
        let sql = format!(
            "SELECT key, val FROM entries WHERE key IN ({placeholders}) AND (exp <= 0 OR exp > ?)"
        );
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key.as_str());
        }
        query = query.bind(now);
        let rows = query.fetch_all(&self.pool).await?;

        let mut present = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let blob: Vec<u8> = row.try_get("val")?;
            let value = codec::decode(&blob).map_err(|source| CacheError::Corrupt {
                key: key.clone(),
                source,
            })?;
            present.insert(key, value);
        }

        Ok(keys
            .iter()
            .map(|k| present.get(k.as_str()).cloned())
            .collect())
    }

    async fn set_many_inner(
        &self,
        entries: Vec<(PageHash, Value)>,
        ttl: Option<u64>,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let ttl = ttl.unwrap_or(self.limits.default_timeout);
        let now = now_secs();
        let exp = if ttl == 0 { 0.0 } else { now + ttl as f64 };

        let row_placeholders = vec!["(?, ?, ?, ?)"; entries.len()].join(",");
        let sql = format!(
            "INSERT INTO entries (key, val, exp, updated) VALUES {row_placeholders}
             ON CONFLICT(key) DO UPDATE SET val = excluded.val, exp = excluded.exp, updated = excluded.updated"
        );
        let mut query = sqlx::query(&sql);
        for (key, value) in &entries {
            let blob = codec::encode(value).map_err(|source| CacheError::Corrupt {
                key: key.as_str().to_string(),
                source,
            })?;
            query = query.bind(key.as_str()).bind(blob).bind(exp).bind(now);
        }
        query.execute(&self.pool).await?;

        self.evict().await
    }

    async fn delete_many_inner(&self, keys: &[PageHash]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; keys.len()].join(",");
        let sql = format!("DELETE FROM entries WHERE key IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key.as_str());
        }
        let removed = query.execute(&self.pool).await?.rows_affected();
        self.evict().await?;
        Ok(removed)
    }

    /// Three-phase eviction sweep: expired rows, then threshold-based
    /// LRU-by-write, then max-size batched eviction. Run in full after
    /// every mutating operation rather than a partial sweep keyed to
    /// which operation ran.
    async fn evict(&self) -> Result<(), CacheError> {
        let now = now_secs();
        sqlx::query("DELETE FROM entries WHERE exp > 0 AND exp <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        if self.limits.threshold > 0 {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
                .fetch_one(&self.pool)
                .await?;
            let count = count.max(0) as u64;
            if count > self.limits.threshold {
                let excess = count - self.limits.threshold;
                sqlx::query(
                    "DELETE FROM entries WHERE key IN (
                        SELECT key FROM entries ORDER BY updated ASC LIMIT ?
                    )",
                )
                .bind(excess as i64)
                .execute(&self.pool)
                .await?;
            }
        }

        if self.limits.max_size > 0 {
            loop {
                let total: Option<i64> = sqlx::query_scalar("SELECT SUM(LENGTH(val)) FROM entries")
                    .fetch_one(&self.pool)
                    .await?;
                let total = total.unwrap_or(0).max(0) as u64;
                if total <= self.limits.max_size {
                    break;
                }

                let deleted = sqlx::query(
                    "DELETE FROM entries WHERE key IN (
                        SELECT key FROM entries ORDER BY updated ASC LIMIT 10
                    )",
                )
                .execute(&self.pool)
                .await?
                .rows_affected();

                if deleted == 0 {
                    break;
                }
            }
        }

        Ok(())
    }
}

fn now_secs() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_nanos() as f64 / 1_000_000_000.0
}

#[async_trait]
impl Cache for SqliteCache {
    async fn has(&self, key: &PageHash) -> Result<bool, CacheError> {
        self.degrade_read(self.has_inner(key).await, false)
    }

    /// Single round trip: one `key IN (...)` query rather than one
    /// query per key.
    async fn has_many(&self, keys: &[PageHash]) -> Result<Vec<bool>, CacheError> {
        let default = vec![false; keys.len()];
        let result = self.has_many_inner(keys).await;
        self.degrade_read(result, default)
    }

    async fn get(&self, key: &PageHash) -> Result<Option<Value>, CacheError> {
        self.degrade_read(self.get_inner(key).await, None)
    }

    /// One `key IN (...)` query for the whole batch.
    async fn get_many(&self, keys: &[PageHash]) -> Result<Vec<Option<Value>>, CacheError> {
        let default = vec![None; keys.len()];
        let result = self.get_many_inner(keys).await;
        self.degrade_read(result, default)
    }

    async fn set(&self, key: &PageHash, value: Value, ttl: Option<u64>) -> Result<(), CacheError> {
        self.degrade_write(self.set_inner(key, &value, ttl).await)
    }

    /// One multi-row INSERT for the whole batch, followed by one
    /// eviction sweep.
    async fn set_many(
        &self,
        entries: Vec<(PageHash, Value)>,
        ttl: Option<u64>,
    ) -> Result<(), CacheError> {
        self.degrade_write(self.set_many_inner(entries, ttl).await)
    }

    async fn delete_many(&self, keys: &[PageHash]) -> Result<u64, CacheError> {
        self.degrade_read(self.delete_many_inner(keys).await, 0)
    }

    async fn add(&self, key: &PageHash, value: Value, ttl: Option<u64>) -> Result<bool, CacheError> {
        if self.has_inner(key).await? {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn delete(&self, key: &PageHash) -> Result<bool, CacheError> {
        let result = async {
            let rows = sqlx::query("DELETE FROM entries WHERE key = ?")
                .bind(key.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected();
            self.evict().await?;
            Ok(rows > 0)
        }
        .await;

        self.degrade_read(result, false)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let result = async {
            sqlx::query("DELETE FROM entries").execute(&self.pool).await?;
            sqlx::query("VACUUM").execute(&self.pool).await?;
            Ok(())
        }
        .await;

        self.degrade_write(result)
    }
}
