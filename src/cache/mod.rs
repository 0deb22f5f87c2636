//! Persisted key/value cache with fresh and stale read modes.
//!
//! Entries live in the `cache_entries` table. Every key carries the
//! [`CACHE_NAMESPACE`] prefix so unrelated rows never collide with cached
//! responses. Writes are last-write-wins per key.

use crate::error::AppError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const CACHE_NAMESPACE: &str = "analysis_cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Reject entries at or past their expiry.
    Fresh,
    /// Return any entry that exists. Only used as a rate-limit fallback.
    StaleAllowed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at_ms: i64,
    pub expires_at_ms: i64,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Builds the deterministic key for an endpoint and its parameters.
///
/// Parameters are sorted by name so call sites may pass them in any order.
pub fn cache_key(endpoint: &str, params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|lhs, rhs| lhs.0.cmp(rhs.0).then_with(|| lhs.1.cmp(&rhs.1)));

    let encoded = sorted
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    format!("{CACHE_NAMESPACE}:{endpoint}_{encoded}")
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn write<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), AppError> {
        self.write_at(key, value, ttl, now_unix_ms()).await
    }

    pub async fn write_at<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<(), AppError> {
        let payload_json = serde_json::to_string(value)?;
        let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
        let expires_at_ms = now_ms.saturating_add(ttl_ms);

        sqlx::query(
            "INSERT INTO cache_entries (cache_key, payload_json, written_at_ms, expires_at_ms) VALUES (?, ?, ?, ?) \
             ON CONFLICT(cache_key) DO UPDATE SET payload_json=excluded.payload_json, written_at_ms=excluded.written_at_ms, expires_at_ms=excluded.expires_at_ms",
        )
        .bind(key)
        .bind(payload_json)
        .bind(now_ms)
        .bind(expires_at_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn read<T: DeserializeOwned>(
        &self,
        key: &str,
        mode: ReadMode,
    ) -> Result<Option<CacheEntry<T>>, AppError> {
        self.read_at(key, mode, now_unix_ms()).await
    }

    pub async fn read_at<T: DeserializeOwned>(
        &self,
        key: &str,
        mode: ReadMode,
        now_ms: i64,
    ) -> Result<Option<CacheEntry<T>>, AppError> {
        let row = sqlx::query(
            "SELECT payload_json, written_at_ms, expires_at_ms FROM cache_entries WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload_json: String = row.try_get("payload_json")?;
        let written_at_ms: i64 = row.try_get("written_at_ms")?;
        let expires_at_ms: i64 = row.try_get("expires_at_ms")?;

        if mode == ReadMode::Fresh && now_ms >= expires_at_ms {
            return Ok(None);
        }

        let mut payload = payload_json.into_bytes();
        let value = match simd_json::serde::from_slice::<T>(payload.as_mut_slice()) {
            Ok(value) => value,
            Err(error) => {
                warn!(key, %error, "dropping undecodable cache entry");
                self.invalidate(key).await?;
                return Ok(None);
            }
        };

        Ok(Some(CacheEntry {
            value,
            written_at_ms,
            expires_at_ms,
        }))
    }

    pub async fn invalidate(&self, key: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes every entry written under the cache namespace.
    pub async fn clear_namespace(&self) -> Result<u64, AppError> {
        let prefix = format!("{CACHE_NAMESPACE}:");
        let prefix_len = prefix.chars().count() as i64;
        let result = sqlx::query("DELETE FROM cache_entries WHERE substr(cache_key, 1, ?) = ?")
            .bind(prefix_len)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn prune_expired_at(&self, now_ms: i64) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at_ms <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_memory_pool;
    use serde_json::{json, Value};

    async fn store() -> CacheStore {
        let pool = initialize_memory_pool()
            .await
            .expect("memory pool should initialize");
        CacheStore::new(pool)
    }

    #[test]
    fn cache_key_is_namespaced_and_order_independent() {
        let lhs = cache_key(
            "/entities/batch",
            &[("ids", "AAPL,MSFT".to_string()), ("fields", "quote".to_string())],
        );
        let rhs = cache_key(
            "/entities/batch",
            &[("fields", "quote".to_string()), ("ids", "AAPL,MSFT".to_string())],
        );

        assert_eq!(lhs, rhs);
        assert_eq!(lhs, "analysis_cache:/entities/batch_fields=quote&ids=AAPL,MSFT");
    }

    #[test]
    fn cache_key_without_params_keeps_separator() {
        assert_eq!(
            cache_key("/jobs/42/result", &[]),
            "analysis_cache:/jobs/42/result_"
        );
    }

    #[tokio::test]
    async fn fresh_read_respects_ttl_boundary() {
        let cache = store().await;
        let key = cache_key("/jobs/1/result", &[]);
        cache
            .write_at(&key, &json!({"action": "BUY"}), Duration::from_millis(1_000), 10_000)
            .await
            .expect("write should succeed");

        let before_expiry = cache
            .read_at::<Value>(&key, ReadMode::Fresh, 10_999)
            .await
            .expect("read should succeed");
        assert_eq!(
            before_expiry.map(|entry| entry.value),
            Some(json!({"action": "BUY"}))
        );

        let at_expiry = cache
            .read_at::<Value>(&key, ReadMode::Fresh, 11_000)
            .await
            .expect("read should succeed");
        assert!(at_expiry.is_none());
    }

    #[tokio::test]
    async fn stale_read_returns_expired_entries() {
        let cache = store().await;
        let key = cache_key("/entities/batch", &[("ids", "AAPL".to_string())]);
        cache
            .write_at(&key, &json!({"AAPL": {"price": 190.1}}), Duration::from_secs(60), 0)
            .await
            .expect("write should succeed");

        let entry = cache
            .read_at::<Value>(&key, ReadMode::StaleAllowed, 10_000_000)
            .await
            .expect("read should succeed")
            .expect("stale entry should still be served");

        assert_eq!(entry.written_at_ms, 0);
        assert_eq!(entry.expires_at_ms, 60_000);
        assert!(!entry.is_fresh_at(10_000_000));
    }

    #[tokio::test]
    async fn writes_overwrite_previous_value() {
        let cache = store().await;
        let key = cache_key("/jobs/7/status", &[]);
        cache
            .write_at(&key, &json!({"status": "running"}), Duration::from_secs(5), 100)
            .await
            .expect("first write should succeed");
        cache
            .write_at(&key, &json!({"status": "completed"}), Duration::from_secs(5), 200)
            .await
            .expect("second write should succeed");

        let entry = cache
            .read_at::<Value>(&key, ReadMode::Fresh, 300)
            .await
            .expect("read should succeed")
            .expect("entry should exist");
        assert_eq!(entry.value, json!({"status": "completed"}));
        assert_eq!(entry.written_at_ms, 200);
    }

    #[tokio::test]
    async fn missing_key_reads_as_none_in_both_modes() {
        let cache = store().await;
        let key = cache_key("/jobs/unknown/result", &[]);

        for mode in [ReadMode::Fresh, ReadMode::StaleAllowed] {
            let entry = cache
                .read_at::<Value>(&key, mode, 0)
                .await
                .expect("read should succeed");
            assert!(entry.is_none());
        }
    }

    #[tokio::test]
    async fn prune_and_clear_remove_entries() {
        let cache = store().await;
        cache
            .write_at("analysis_cache:/a_", &1_u32, Duration::from_millis(10), 0)
            .await
            .expect("write should succeed");
        cache
            .write_at("analysis_cache:/b_", &2_u32, Duration::from_millis(1_000), 0)
            .await
            .expect("write should succeed");

        let pruned = cache.prune_expired_at(500).await.expect("prune should succeed");
        assert_eq!(pruned, 1);

        let cleared = cache.clear_namespace().await.expect("clear should succeed");
        assert_eq!(cleared, 1);
    }

    #[tokio::test]
    async fn clear_matches_namespace_prefix_literally() {
        let cache = store().await;
        for key in ["analysis_cache:/a_", "analysisXcache:/b_", "other:/c_"] {
            cache
                .write_at(key, &1_u32, Duration::from_secs(60), 0)
                .await
                .expect("write should succeed");
        }

        let cleared = cache.clear_namespace().await.expect("clear should succeed");

        assert_eq!(cleared, 1);
        for key in ["analysisXcache:/b_", "other:/c_"] {
            let entry = cache
                .read_at::<u32>(key, ReadMode::StaleAllowed, 0)
                .await
                .expect("read should succeed");
            assert!(entry.is_some(), "{key} should survive");
        }
    }

    #[tokio::test]
    async fn undecodable_entry_is_dropped() {
        let cache = store().await;
        cache
            .write_at("analysis_cache:/n_", &"not a number", Duration::from_secs(1), 0)
            .await
            .expect("write should succeed");

        let entry = cache
            .read_at::<u32>("analysis_cache:/n_", ReadMode::StaleAllowed, 0)
            .await
            .expect("read should succeed");
        assert!(entry.is_none());
        assert!(!cache
            .invalidate("analysis_cache:/n_")
            .await
            .expect("invalidate should succeed"));
    }
}
