//! HTTP server setup and configuration.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::heartbeat::HeartbeatMultiplexer;
use super::transport::UpstreamClient;
use super::types::StreamRouting;
use crate::config::Config;
use crate::credentials::{
    CredentialResolver, CredentialStore, InMemoryCredentialCache, SqliteCredentialStore,
    StaticCredentialStore,
};
use crate::storage::{self, SqliteUsageLog, TracingUsageLog, UsageLogSink};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub credentials: Arc<CredentialResolver>,
    pub upstream: UpstreamClient,
    pub heartbeat: HeartbeatMultiplexer,
    pub routing: StreamRouting,
    pub usage_log: Arc<dyn UsageLogSink>,
}

impl AppState {
    /// Wire up stores, sinks and the upstream client from config.
    ///
    /// With a `[database]` section, credentials and usage records live in
    /// SQLite and configured credentials are seeded into it. Without one,
    /// credentials come straight from config and usage goes to the log.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(
            config.upstream.base_url.clone(),
            config.upstream.request_timeout(),
            config.upstream.connect_timeout(),
        )?;

        let (store, usage_log): (Arc<dyn CredentialStore>, Arc<dyn UsageLogSink>) =
            match &config.database {
                Some(database) => {
                    let pool = storage::init_pool(&database.path).await?;
                    tracing::info!(path = %database.path, "Database initialized");

                    let store = SqliteCredentialStore::new(pool.clone());
                    for credential in &config.credentials {
                        if let Some(key) = &credential.api_key {
                            store.upsert(&credential.caller_id, key).await?;
                        }
                    }

                    let usage_log: Arc<dyn UsageLogSink> = if config.logging.log_requests {
                        Arc::new(SqliteUsageLog::new(pool))
                    } else {
                        Arc::new(TracingUsageLog)
                    };
                    let store: Arc<dyn CredentialStore> = Arc::new(store);
                    (store, usage_log)
                }
                None => {
                    let store: Arc<dyn CredentialStore> =
                        Arc::new(StaticCredentialStore::from_config(&config.credentials));
                    let usage_log: Arc<dyn UsageLogSink> = Arc::new(TracingUsageLog);
                    (store, usage_log)
                }
            };

        let credentials = CredentialResolver::new(
            Arc::new(InMemoryCredentialCache::new()),
            store,
            config.cache.credential_ttl(),
            config.cache.touch_throttle(),
        );

        Ok(Self {
            credentials: Arc::new(credentials),
            upstream,
            heartbeat: HeartbeatMultiplexer::new(config.upstream.heartbeat_interval()),
            routing: StreamRouting::new(config.upstream.native_stream_variants.iter().cloned()),
            usage_log,
        })
    }
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1beta/models/:target", post(handlers::generate))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let state = AppState::from_config(&config).await?;

    tracing::info!(
        upstream = %state.upstream.base_url(),
        heartbeat_secs = state.heartbeat.interval().as_secs(),
        native_stream_variants = ?config.upstream.native_stream_variants,
        credentials = config.credentials.len(),
        "Gateway configured"
    );

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting relaygate server");

    axum::serve(listener, app).await?;

    Ok(())
}
