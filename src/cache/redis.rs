//! Redis Backends
//!
//! Distributed tier, stampede lock and existence filter over a shared
//! `deadpool-redis` pool. Every command error surfaces as [`Error::Redis`] or
//! [`Error::Pool`]; the engine decides what a failure means.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime, Timeouts};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::filter::{BloomParams, ExistenceFilter, FilterInfo};
use super::key::CacheKey;
use super::l2::L2Store;
use super::lock::DistributedLock;
use crate::error::{Error, Result};

/// Keys fetched per SCAN round
const SCAN_BATCH: usize = 500;

/// Delete the lock key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Build a pool and verify that Redis answers
pub async fn connect_pool(url: &str, max_size: usize, timeout: Duration) -> Result<Pool> {
    let mut config = Config::from_url(url);
    let mut pool_config = PoolConfig::new(max_size);
    pool_config.timeouts = Timeouts {
        wait: Some(timeout),
        create: Some(timeout),
        recycle: Some(timeout),
    };
    config.pool = Some(pool_config);

    let pool = config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| Error::Pool(e.to_string()))?;

    let mut conn = pool.get().await.map_err(|e| Error::Pool(e.to_string()))?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!(max_size, "Connected to Redis");
    Ok(pool)
}

async fn connection(pool: &Pool) -> Result<Connection> {
    pool.get().await.map_err(|e| Error::Pool(e.to_string()))
}

/// Escape SCAN MATCH glob metacharacters
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

// =============================================================================
// L2 store
// =============================================================================

/// Redis-backed distributed tier
#[derive(Clone)]
pub struct RedisL2Store {
    pool: Pool,
}

impl RedisL2Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl L2Store for RedisL2Store {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = connection(&self.pool).await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = connection(&self.pool).await?;
        Ok(conn.del(keys).await?)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut conn = connection(&self.pool).await?;
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix, removed, "Deleted keys by prefix");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        Ok(conn.exists(key).await?)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// Lock
// =============================================================================

/// `SET NX PX` lease lock with compare-and-delete release
#[derive(Clone)]
pub struct RedisLock {
    pool: Pool,
}

impl RedisLock {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(lease))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// Existence filter
// =============================================================================

/// Bloom filter stored as a Redis bitmap
///
/// Every instance sharing `key` and geometry sees the same set.
pub struct RedisBloomFilter {
    pool: Pool,
    key: String,
    params: BloomParams,
    insertions: AtomicU64,
}

impl RedisBloomFilter {
    pub fn new(pool: Pool, key: impl Into<String>, params: BloomParams) -> Self {
        Self {
            pool,
            key: key.into(),
            params,
            insertions: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ExistenceFilter for RedisBloomFilter {
    async fn add(&self, key: &CacheKey) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let mut pipe = redis::pipe();
        for bit in self.params.positions(key) {
            pipe.cmd("SETBIT").arg(&self.key).arg(bit).arg(1).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        self.insertions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn might_contain(&self, key: &CacheKey) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let mut pipe = redis::pipe();
        for bit in self.params.positions(key) {
            pipe.cmd("GETBIT").arg(&self.key).arg(bit);
        }
        let bits: Vec<u8> = pipe.query_async(&mut conn).await?;
        Ok(bits.iter().all(|&b| b == 1))
    }

    async fn add_all(&self, keys: &[CacheKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = connection(&self.pool).await?;
        let mut pipe = redis::pipe();
        for key in keys {
            for bit in self.params.positions(key) {
                pipe.cmd("SETBIT").arg(&self.key).arg(bit).arg(1).ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        self.insertions
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn info(&self) -> FilterInfo {
        FilterInfo {
            bits: self.params.bits,
            hashes: self.params.hashes,
            insertions: self.insertions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("hot:user:"), "hot:user:");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
