use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::UnixTimeMs;
use crate::store::{DurableStore, StorageError};

/// All cache storage keys carry this prefix. `clear_all` is scoped to
/// it, so clearing the cache can never discard unsynced queue data.
pub const CACHE_PREFIX: &str = "cache:";

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Age past which an entry stops counting as a hit.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig {
                reason: "ttl must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid cache config: {reason}")]
    InvalidConfig { reason: String },
}

/// A named, timestamped snapshot of server-derived data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct CacheEntry {
    payload: Vec<u8>,
    cached_at: UnixTimeMs,
}

impl CacheEntry {
    fn is_expired(&self, now: UnixTimeMs, ttl: Duration) -> bool {
        now.0.saturating_sub(self.cached_at.0) > ttl.as_millis() as u64
    }
}

/// Time-bounded read-through cache for server-derived lists, backed by
/// the durable store. Expired entries are treated as misses and removed
/// lazily on the read that finds them.
pub struct CacheManager {
    store: Arc<dyn DurableStore>,
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(store: Arc<dyn DurableStore>, config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Miss when absent, expired, or undecodable. A corrupt entry is
    /// evicted and reported as a miss; cache payloads are
    /// reconstructible from the server.
    pub async fn get(&self, key: &str, now: UnixTimeMs) -> Result<Option<Vec<u8>>, CacheError> {
        let storage_key = Self::storage_key(key);
        let Some(bytes) = self.store.read(&storage_key).await? else {
            return Ok(None);
        };

        let entry: CacheEntry = match ciborium::from_reader(bytes.as_slice()) {
            Ok(entry) => entry,
            Err(e) => {
                let e: ciborium::de::Error<std::io::Error> = e;
                warn!(key, error = %e, "undecodable cache entry evicted");
                self.store.remove(&storage_key).await?;
                return Ok(None);
            }
        };

        if entry.is_expired(now, self.config.ttl) {
            self.store.remove(&storage_key).await?;
            return Ok(None);
        }

        Ok(Some(entry.payload))
    }

    /// Overwrites unconditionally, stamping `cached_at = now`.
    pub async fn put(&self, key: &str, payload: Vec<u8>, now: UnixTimeMs) -> Result<(), CacheError> {
        let entry = CacheEntry {
            payload,
            cached_at: now,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&entry, &mut bytes).map_err(
            |e: ciborium::ser::Error<std::io::Error>| CacheError::Serialization(e.to_string()),
        )?;
        self.store.write(&Self::storage_key(key), &bytes).await?;
        Ok(())
    }

    /// Drops one dataset regardless of age, for opportunistic
    /// invalidation after a successful sync.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(&Self::storage_key(key)).await?;
        Ok(())
    }

    /// Removes every cache entry, and nothing else. Used on logout.
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        let keys = self.store.list(CACHE_PREFIX).await?;
        let count = keys.len();
        for key in keys {
            self.store.remove(&key).await?;
        }
        info!(count, "cache cleared");
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        now: UnixTimeMs,
    ) -> Result<Option<T>, CacheError> {
        match self.get(key, now).await? {
            None => Ok(None),
            Some(payload) => serde_json::from_slice(&payload)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        now: UnixTimeMs,
    ) -> Result<(), CacheError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.put(key, payload, now).await
    }

    fn storage_key(key: &str) -> String {
        format!("{CACHE_PREFIX}{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache_over(store: Arc<MemoryStore>, ttl: Duration) -> CacheManager {
        CacheManager::new(store, CacheConfig { ttl }).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_hits() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store, DEFAULT_TTL);

        cache
            .put("incident-feed", b"feed-bytes".to_vec(), UnixTimeMs(1_000))
            .await
            .unwrap();
        assert_eq!(
            cache.get("incident-feed", UnixTimeMs(1_001)).await.unwrap(),
            Some(b"feed-bytes".to_vec())
        );
    }

    #[tokio::test]
    async fn missing_key_is_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store, DEFAULT_TTL);
        assert_eq!(cache.get("nothing", UnixTimeMs(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entry_is_miss_and_lazily_removed() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store.clone(), Duration::from_secs(60));

        cache
            .put("incident-feed", b"old".to_vec(), UnixTimeMs(0))
            .await
            .unwrap();

        // One millisecond past the TTL on a simulated clock.
        let later = UnixTimeMs(60_001);
        assert_eq!(cache.get("incident-feed", later).await.unwrap(), None);
        assert_eq!(store.read("cache:incident-feed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entry_at_exact_ttl_still_hits() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store, Duration::from_secs(60));

        cache
            .put("incident-feed", b"v".to_vec(), UnixTimeMs(0))
            .await
            .unwrap();
        assert!(cache
            .get("incident-feed", UnixTimeMs(60_000))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn overwrite_refreshes_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store, Duration::from_secs(60));

        cache
            .put("incident-feed", b"old".to_vec(), UnixTimeMs(0))
            .await
            .unwrap();
        cache
            .put("incident-feed", b"new".to_vec(), UnixTimeMs(59_000))
            .await
            .unwrap();

        assert_eq!(
            cache.get("incident-feed", UnixTimeMs(100_000)).await.unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn clear_all_spares_other_namespaces() {
        let store = Arc::new(MemoryStore::new());
        store.write("queue:incidents", b"queue-data").await.unwrap();
        store.write("sync:last-sync-ms", b"12").await.unwrap();

        let cache = cache_over(store.clone(), DEFAULT_TTL);
        cache
            .put("incident-feed", b"a".to_vec(), UnixTimeMs(0))
            .await
            .unwrap();
        cache
            .put("station-list", b"b".to_vec(), UnixTimeMs(0))
            .await
            .unwrap();

        cache.clear_all().await.unwrap();

        assert_eq!(cache.get("incident-feed", UnixTimeMs(1)).await.unwrap(), None);
        assert_eq!(cache.get("station-list", UnixTimeMs(1)).await.unwrap(), None);
        assert_eq!(
            store.read("queue:incidents").await.unwrap(),
            Some(b"queue-data".to_vec())
        );
        assert_eq!(
            store.read("sync:last-sync-ms").await.unwrap(),
            Some(b"12".to_vec())
        );
    }

    #[tokio::test]
    async fn undecodable_entry_is_evicted_as_miss() {
        let store = Arc::new(MemoryStore::new());
        store
            .inject_raw("cache:incident-feed", b"junk".to_vec())
            .await;

        let cache = cache_over(store.clone(), DEFAULT_TTL);
        assert_eq!(cache.get("incident-feed", UnixTimeMs(0)).await.unwrap(), None);
        assert_eq!(store.read("cache:incident-feed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn typed_helpers_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Feed {
            incident_ids: Vec<String>,
        }

        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(store, DEFAULT_TTL);

        let feed = Feed {
            incident_ids: vec!["a".into(), "b".into()],
        };
        cache
            .put_json("incident-feed", &feed, UnixTimeMs(0))
            .await
            .unwrap();

        let loaded: Feed = cache
            .get_json("incident-feed", UnixTimeMs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, feed);
    }
}
