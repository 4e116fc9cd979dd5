//! Usage record data types and sink implementations.

use async_trait::async_trait;
use sqlx::SqlitePool;

/// One outcome row, written exactly once per request.
///
/// All fields are owned so the record can move into the request task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub correlation_id: String,
    pub timestamp: String,
    pub caller_id: String,
    pub endpoint: String,
    pub model: String,
    pub config_type: Option<String>,
    pub streaming: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Usage sink unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination for usage records.
#[async_trait]
pub trait UsageLogSink: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> Result<(), SinkError>;
}

/// SQLite integers are signed; counts beyond `i64::MAX` are stored as the max.
fn clamp_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl UsageRecord {
    /// Insert this record into the `usage_logs` table.
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO usage_logs (
                correlation_id, timestamp, caller_id, endpoint, model, config_type,
                streaming, input_tokens, output_tokens, total_tokens,
                success, status_code, error_message, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.correlation_id)
        .bind(&self.timestamp)
        .bind(&self.caller_id)
        .bind(&self.endpoint)
        .bind(&self.model)
        .bind(self.config_type.as_deref())
        .bind(self.streaming)
        .bind(clamp_count(self.input_tokens))
        .bind(clamp_count(self.output_tokens))
        .bind(clamp_count(self.total_tokens))
        .bind(self.success)
        .bind(self.status_code.map(|v| v as i32))
        .bind(self.error_message.as_deref())
        .bind(self.duration_ms)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// SQLite-backed sink.
#[derive(Clone)]
pub struct SqliteUsageLog {
    pool: SqlitePool,
}

impl SqliteUsageLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLogSink for SqliteUsageLog {
    async fn record(&self, record: &UsageRecord) -> Result<(), SinkError> {
        record.insert(&self.pool).await?;
        Ok(())
    }
}

/// Sink used when no database is configured: the record goes to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageLog;

#[async_trait]
impl UsageLogSink for TracingUsageLog {
    async fn record(&self, record: &UsageRecord) -> Result<(), SinkError> {
        tracing::info!(
            correlation_id = %record.correlation_id,
            caller_id = %record.caller_id,
            endpoint = %record.endpoint,
            model = %record.model,
            streaming = record.streaming,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            total_tokens = record.total_tokens,
            success = record.success,
            status_code = ?record.status_code,
            error_message = ?record.error_message,
            duration_ms = record.duration_ms,
            "Usage recorded"
        );
        Ok(())
    }
}
