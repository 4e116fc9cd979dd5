//! Process-wide credential cache.
//!
//! The resolver only talks to the [`CredentialCache`] trait, so tests (or an
//! external cache) can stand in for [`InMemoryCredentialCache`]. Entries
//! expire passively: an expired entry is dropped the next time it is read.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::ApiKey;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Credential cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CredentialCache: Send + Sync {
    async fn get(&self, caller_id: &str) -> Result<Option<ApiKey>, CacheError>;

    async fn put(&self, caller_id: &str, key: ApiKey, ttl: Duration) -> Result<(), CacheError>;

    async fn invalidate(&self, caller_id: &str) -> Result<(), CacheError>;

    /// Set the "recently touched" marker unless a live one exists.
    ///
    /// Returns `true` when this call set the marker.
    async fn mark_touched(&self, caller_id: &str, ttl: Duration) -> Result<bool, CacheError>;
}

struct Expiring {
    key: ApiKey,
    expires_at: Instant,
}

/// DashMap-backed cache; last writer wins per key.
#[derive(Default)]
pub struct InMemoryCredentialCache {
    credentials: DashMap<String, Expiring>,
    touched: DashMap<String, Instant>,
}

impl InMemoryCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored credential entries, expired ones included.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Number of live or not-yet-swept touch markers.
    pub fn touched_len(&self) -> usize {
        self.touched.len()
    }
}

#[async_trait]
impl CredentialCache for InMemoryCredentialCache {
    async fn get(&self, caller_id: &str) -> Result<Option<ApiKey>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.credentials.get(caller_id) {
            if now < entry.expires_at {
                return Ok(Some(entry.key.clone()));
            }
        }
        // Shard guard from `get` is released before this point.
        self.credentials
            .remove_if(caller_id, |_, entry| now >= entry.expires_at);
        Ok(None)
    }

    async fn put(&self, caller_id: &str, key: ApiKey, ttl: Duration) -> Result<(), CacheError> {
        self.credentials.insert(
            caller_id.to_string(),
            Expiring {
                key,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, caller_id: &str) -> Result<(), CacheError> {
        self.credentials.remove(caller_id);
        Ok(())
    }

    async fn mark_touched(&self, caller_id: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        // Lapsed markers carry no information; drop them so the map tracks
        // only callers seen within the throttle window.
        self.touched.retain(|_, expires_at| now < *expires_at);
        match self.touched.entry(caller_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn entry_is_served_until_ttl_elapses() {
        let cache = InMemoryCredentialCache::new();
        cache.put("alice", ApiKey::from("sk-a"), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        let hit = cache.get("alice").await.unwrap();
        assert_eq!(hit.unwrap().expose_secret(), "sk-a");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("alice").await.unwrap().is_none());
        assert!(cache.is_empty(), "expired entry should be dropped on read");
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let cache = InMemoryCredentialCache::new();
        cache.put("alice", ApiKey::from("old"), TTL).await.unwrap();
        cache.put("alice", ApiKey::from("new"), TTL).await.unwrap();
        assert_eq!(cache.get("alice").await.unwrap().unwrap().expose_secret(), "new");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_drops_entry() {
        let cache = InMemoryCredentialCache::new();
        cache.put("alice", ApiKey::from("sk-a"), TTL).await.unwrap();
        cache.invalidate("alice").await.unwrap();
        assert!(cache.get("alice").await.unwrap().is_none());
        // Invalidating a missing key is fine.
        cache.invalidate("nobody").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn touch_marker_throttles_independently() {
        let cache = InMemoryCredentialCache::new();
        assert!(cache.mark_touched("alice", TTL).await.unwrap());
        assert!(!cache.mark_touched("alice", TTL).await.unwrap());
        assert!(cache.mark_touched("bob", TTL).await.unwrap());

        // Marker has no bearing on the credential entries.
        assert!(cache.get("alice").await.unwrap().is_none());

        tokio::time::advance(TTL).await;
        assert!(cache.mark_touched("alice", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_touch_markers_are_swept() {
        let cache = InMemoryCredentialCache::new();
        for i in 0..50 {
            cache.mark_touched(&format!("caller-{i}"), TTL).await.unwrap();
        }
        assert_eq!(cache.touched_len(), 50);

        tokio::time::advance(TTL).await;
        assert!(cache.mark_touched("late", TTL).await.unwrap());
        assert_eq!(cache.touched_len(), 1);
    }

    #[tokio::test]
    async fn concurrent_access_is_safe() {
        let cache = std::sync::Arc::new(InMemoryCredentialCache::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let key = ApiKey::from(format!("sk-{i}"));
                cache.put("shared", key, TTL).await.unwrap();
                cache.get("shared").await.unwrap().is_some()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(cache.len(), 1);
    }
}
