//! Authoritative credential stores.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;

use crate::config::{ApiKey, CredentialConfig};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

/// Source of truth for caller credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The caller's usable upstream credential, if one exists.
    async fn get(&self, caller_id: &str) -> Result<Option<ApiKey>, StoreError>;

    /// Record that the caller's credential was just used.
    async fn touch_last_used(&self, caller_id: &str) -> Result<(), StoreError>;
}

/// Credentials listed in the config file.
#[derive(Default)]
pub struct StaticCredentialStore {
    keys: HashMap<String, ApiKey>,
    last_used: DashMap<String, DateTime<Utc>>,
}

impl StaticCredentialStore {
    /// Callers configured without a key are left out, so they resolve as absent.
    pub fn from_config(credentials: &[CredentialConfig]) -> Self {
        let keys = credentials
            .iter()
            .filter_map(|c| c.api_key.clone().map(|key| (c.caller_id.clone(), key)))
            .collect();
        Self {
            keys,
            last_used: DashMap::new(),
        }
    }

    pub fn last_used(&self, caller_id: &str) -> Option<DateTime<Utc>> {
        self.last_used.get(caller_id).map(|ts| *ts)
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn get(&self, caller_id: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self.keys.get(caller_id).cloned())
    }

    async fn touch_last_used(&self, caller_id: &str) -> Result<(), StoreError> {
        self.last_used.insert(caller_id.to_string(), Utc::now());
        Ok(())
    }
}

/// Credentials in the `upstream_credentials` table.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a caller's credential and mark it active.
    pub async fn upsert(&self, caller_id: &str, key: &ApiKey) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO upstream_credentials (caller_id, api_key, is_active)
             VALUES (?, ?, 1)
             ON CONFLICT(caller_id) DO UPDATE SET api_key = excluded.api_key, is_active = 1",
        )
        .bind(caller_id)
        .bind(key.expose_secret())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate(&self, caller_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE upstream_credentials SET is_active = 0 WHERE caller_id = ?")
            .bind(caller_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_used(&self, caller_id: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT last_used_at FROM upstream_credentials WHERE caller_id = ?")
                .bind(caller_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(ts,)| ts))
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, caller_id: &str) -> Result<Option<ApiKey>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT api_key FROM upstream_credentials WHERE caller_id = ? AND is_active = 1",
        )
        .bind(caller_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(key,)| ApiKey::from(key)))
    }

    async fn touch_last_used(&self, caller_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE upstream_credentials SET last_used_at = ? WHERE caller_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(caller_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
