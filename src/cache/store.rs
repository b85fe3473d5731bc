use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use moka::future::Cache;
use moka::Expiry;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

const REDIS_PREFIX: &str = "coopgate:cache:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// A value stored under a key for `ttl_secs` seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl_secs: u64,
    pub written_at: SystemTime,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl_secs: u64) -> Self {
        Self {
            key: key.into(),
            value,
            ttl_secs,
            written_at: SystemTime::now(),
        }
    }

    pub fn expires_at(&self) -> SystemTime {
        self.written_at + Duration::from_secs(self.ttl_secs)
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at()
    }

    fn to_wire(&self) -> Result<String, StoreError> {
        let written_at_ms = self
            .written_at
            .duration_since(UNIX_EPOCH)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?
            .as_millis() as u64;

        Ok(serde_json::to_string(&WireEntry {
            value: STANDARD.encode(&self.value),
            ttl_secs: self.ttl_secs,
            written_at_ms,
        })?)
    }

    fn from_wire(key: &str, raw: &str) -> Result<Self, StoreError> {
        let wire: WireEntry = serde_json::from_str(raw)?;
        let value = STANDARD
            .decode(wire.value)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Self {
            key: key.to_string(),
            value,
            ttl_secs: wire.ttl_secs,
            written_at: UNIX_EPOCH + Duration::from_millis(wire.written_at_ms),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    value: String,
    ttl_secs: u64,
    written_at_ms: u64,
}

/// Shared key/value store behind the cache-aside layer
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError>;

    /// Returns whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every key matching a `*` wildcard pattern
    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError>;

    fn backend(&self) -> &'static str;
}

struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(Duration::from_secs(value.ttl_secs))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(Duration::from_secs(value.ttl_secs))
    }
}

/// In-process store on a moka cache with per-entry TTL
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, CacheEntry>,
}

impl MemoryStore {
    pub fn new(max_capacity: u64) -> Self {
        info!(max_capacity, "Initialized in-memory cache store");
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryExpiry)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        // moka evicts lazily; never hand out an entry past its TTL
        Ok(self.cache.get(key).await.filter(|entry| !entry.is_expired()))
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.cache.insert(entry.key.clone(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key_matches(pattern, key))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        for key in &keys {
            self.cache.invalidate(key).await;
        }
        Ok(keys.len() as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed store shared by every gateway process
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected Redis cache store");
        Ok(Self { connection })
    }

    fn redis_key(key: &str) -> String {
        format!("{}{}", REDIS_PREFIX, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await?;

        raw.map(|raw| CacheEntry::from_wire(key, &raw)).transpose()
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError> {
        if entry.ttl_secs == 0 {
            return Ok(());
        }

        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(Self::redis_key(&entry.key))
            .arg(entry.to_wire()?)
            .arg("EX")
            .arg(entry.ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}{}", REDIS_PREFIX, escape_glob(pattern));
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let count: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += count;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed, "Deleted matching cache keys");
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Wildcard match where `*` stands for any run of characters
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = key.strip_prefix(first) else {
        return false;
    };

    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return true,
    };

    for part in middle {
        match remaining.find(part) {
            Some(index) => remaining = &remaining[index + part.len()..],
            None => return false,
        }
    }

    remaining.ends_with(last)
}

/// Escape Redis glob metacharacters other than `*`
fn escape_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
