//! Caller credential resolution.
//!
//! [`CredentialResolver`] fronts an authoritative [`CredentialStore`] with a
//! TTL-bound [`CredentialCache`]. Cache failures never fail a request: reads
//! fall through to the store and writes are skipped.

pub mod cache;
pub mod store;

pub use cache::{CacheError, CredentialCache, InMemoryCredentialCache};
pub use store::{CredentialStore, SqliteCredentialStore, StaticCredentialStore, StoreError};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::ApiKey;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No upstream credential configured for caller '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CredentialResolver {
    cache: Arc<dyn CredentialCache>,
    store: Arc<dyn CredentialStore>,
    ttl: Duration,
    touch_throttle: Duration,
}

impl CredentialResolver {
    pub fn new(
        cache: Arc<dyn CredentialCache>,
        store: Arc<dyn CredentialStore>,
        ttl: Duration,
        touch_throttle: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            ttl,
            touch_throttle,
        }
    }

    /// Look up the caller's upstream credential, cache first.
    pub async fn resolve(&self, caller_id: &str) -> Result<ApiKey, ResolveError> {
        match self.cache.get(caller_id).await {
            Ok(Some(key)) => {
                tracing::trace!(caller_id = %caller_id, "Credential cache hit");
                return Ok(key);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(caller_id = %caller_id, error = %e, "Credential cache read failed");
            }
        }

        let key = self
            .store
            .get(caller_id)
            .await?
            .ok_or_else(|| ResolveError::NotFound(caller_id.to_string()))?;

        if let Err(e) = self.cache.put(caller_id, key.clone(), self.ttl).await {
            tracing::warn!(caller_id = %caller_id, error = %e, "Credential cache write failed");
        }

        Ok(key)
    }

    /// Throttled, fire-and-forget "last used" bookkeeping.
    ///
    /// Returns the handle of the spawned store write, or `None` when the
    /// throttle marker was live or the cache could not be consulted.
    pub async fn touch(&self, caller_id: &str) -> Option<JoinHandle<()>> {
        match self.cache.mark_touched(caller_id, self.touch_throttle).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!(caller_id = %caller_id, error = %e, "Skipping last-used touch");
                return None;
            }
        }

        let store = Arc::clone(&self.store);
        let caller_id = caller_id.to_string();
        Some(tokio::spawn(async move {
            if let Err(e) = store.touch_last_used(&caller_id).await {
                tracing::warn!(caller_id = %caller_id, error = %e, "Failed to record last-used time");
            }
        }))
    }

    /// Drop the cached credential after a rotation.
    pub async fn invalidate(&self, caller_id: &str) {
        if let Err(e) = self.cache.invalidate(caller_id).await {
            tracing::warn!(caller_id = %caller_id, error = %e, "Credential cache invalidation failed");
        }
    }
}
