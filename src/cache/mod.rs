//! KV cache
//!
//! Small key→value accelerator with TTLs. Two interchangeable backends:
//! an in-process map and Redis. The service starts on the in-process
//! backend; if a Redis URL is configured, a background task keeps trying
//! to connect and swaps the backend in under the write lock once it
//! succeeds. Operations already holding the old backend finish against it,
//! so nothing in flight is lost.
//!
//! Cache failures never propagate: every error degrades to a miss (or
//! `false`) and a warn-level log line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// tokio's Instant so expiry cooperates with paused-time tests
use tokio::time::Instant;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::CacheError;

/// TTLs agreed with the specialized accessors.
pub const EPG_TTL: Duration = Duration::from_secs(3600);
pub const STREAM_TTL: Duration = Duration::from_secs(300);
pub const API_TTL: Duration = Duration::from_secs(30);
pub const METRICS_TTL: Duration = Duration::from_secs(60);
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
    async fn flush(&self) -> Result<(), CacheError>;
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
    fn name(&self) -> &'static str;
}

/// In-process backend: a map with per-key expiry instants. Overwrites
/// replace the deadline, so a reset TTL behaves like the Redis SET.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop expired entries. Reads already skip them; this reclaims the
    /// memory and keeps `keys` listings honest.
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired());
        before - entries.len()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // '*' wildcards only, like the subset of Redis KEYS patterns we use
    if !pattern.contains('*') {
        return pattern == key;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || !key.ends_with(last) {
        return false;
    }
    if key.len() < first.len() + last.len() {
        return false;
    }
    let mut remainder = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match remainder.find(part) {
            Some(pos) => remainder = &remainder[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).is_some_and(|e| !e.expired()))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.evict_expired().await;
        let entries = self.entries.read().await;
        Ok(entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut entries = self.entries.write().await;
        let current = match entries.get(key) {
            Some(entry) if !entry.expired() => entry.value.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + delta;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Redis backend over a shared multiplexed connection.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, delta).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, ttl.as_secs() as i64).await?)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// The cache surface the rest of the crate talks to.
#[derive(Clone)]
pub struct CacheService {
    backend: Arc<RwLock<Arc<dyn CacheBackend>>>,
}

impl CacheService {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(RwLock::new(Arc::new(MemoryCache::new()))),
        }
    }

    /// Serve from memory now; upgrade to Redis in the background when (if)
    /// the connection succeeds.
    pub fn with_redis_upgrade(redis_url: String) -> Self {
        let service = Self::new();
        let backend = service.backend.clone();
        tokio::spawn(async move {
            loop {
                match RedisCache::connect(&redis_url).await {
                    Ok(redis) => {
                        let mut slot = backend.write().await;
                        *slot = Arc::new(redis);
                        info!("Cache upgraded to Redis backend at {redis_url}");
                        return;
                    }
                    Err(e) => {
                        debug!("Redis not reachable yet ({e}); staying on memory cache");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
        service
    }

    async fn current(&self) -> Arc<dyn CacheBackend> {
        self.backend.read().await.clone()
    }

    pub async fn backend_name(&self) -> &'static str {
        self.current().await.name()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match self.current().await.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Cache get failed for {key}: {e}");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        if let Err(e) = self.current().await.set(key, value, ttl).await {
            warn!("Cache set failed for {key}: {e}");
        }
    }

    /// Structured values are serialized to JSON text.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cache value under {key} failed to deserialize: {e}");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(e) => warn!("Cache value under {key} failed to serialize: {e}"),
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.current().await.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Cache delete failed for {key}: {e}");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.current().await.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache exists failed for {key}: {e}");
                false
            }
        }
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        match self.current().await.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache keys failed for {pattern}: {e}");
                Vec::new()
            }
        }
    }

    pub async fn flush(&self) {
        if let Err(e) = self.current().await.flush().await {
            warn!("Cache flush failed: {e}");
        }
    }

    pub async fn increment(&self, key: &str, delta: i64) -> Option<i64> {
        match self.current().await.increment(key, delta).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cache increment failed for {key}: {e}");
                None
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.current().await.expire(key, ttl).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Cache expire failed for {key}: {e}");
                false
            }
        }
    }

    pub async fn healthy(&self) -> bool {
        self.current().await.ping().await.is_ok()
    }

    // Agreed key shapes
    pub fn epg_key(channel_id: &str) -> String {
        format!("epg:{channel_id}")
    }
    pub fn stream_key(stream_id: &str) -> String {
        format!("stream:{stream_id}")
    }
    pub fn lineup_key() -> String {
        "lineup:channels".to_string()
    }
    pub fn metrics_key() -> String {
        "metrics:system".to_string()
    }
    pub fn session_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_set_get_delete() {
        let cache = CacheService::new();
        cache.set("lineup:channels", "[]", Some(API_TTL)).await;
        assert_eq!(cache.get("lineup:channels").await.as_deref(), Some("[]"));
        assert!(cache.exists("lineup:channels").await);
        assert!(cache.delete("lineup:channels").await);
        assert!(cache.get("lineup:channels").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_and_overwrite_resets_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v1", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        // overwrite resets the deadline
        cache
            .set("k", "v2", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v2"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_starts_at_zero() {
        let cache = CacheService::new();
        assert_eq!(cache.increment("hits", 1).await, Some(1));
        assert_eq!(cache.increment("hits", 5).await, Some(6));
    }

    #[tokio::test]
    async fn keys_match_globs() {
        let cache = CacheService::new();
        cache.set("session:a", "1", None).await;
        cache.set("session:b", "1", None).await;
        cache.set("stream:x", "1", None).await;

        let mut keys = cache.keys("session:*").await;
        keys.sort();
        assert_eq!(keys, vec!["session:a", "session:b"]);
        assert_eq!(cache.keys("*").await.len(), 3);
        assert_eq!(cache.keys("nope:*").await.len(), 0);
    }

    #[tokio::test]
    async fn json_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Snapshot {
            active: usize,
        }
        let cache = CacheService::new();
        cache
            .set_json(
                &CacheService::metrics_key(),
                &Snapshot { active: 3 },
                Some(METRICS_TTL),
            )
            .await;
        let back: Snapshot = cache.get_json(&CacheService::metrics_key()).await.unwrap();
        assert_eq!(back, Snapshot { active: 3 });
    }

    #[test]
    fn glob_match_subset() {
        assert!(glob_match("session:*", "session:abc"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("epg:*:today", "epg:ch1:today"));
        assert!(!glob_match("session:*", "stream:abc"));
        assert!(!glob_match("session:abc", "session:abcd"));
        assert!(glob_match("session:abc", "session:abc"));
    }
}
