use async_trait::async_trait;
use time::OffsetDateTime;

use crate::records::{NewBillingSnapshot, NewRequestLog};
use crate::snapshot::{PriceOverrideRow, PriceRow, StorageSnapshot};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct PriceBookRows {
    pub synced: Vec<PriceRow>,
    pub overrides: Vec<PriceOverrideRow>,
}

/// Persisted circuit breaker state, written on every transition so a restart
/// resumes where the fleet left off.
#[derive(Debug, Clone)]
pub struct BreakerPersist {
    pub upstream_id: i64,
    pub state: &'static str,
    pub failure_count: i32,
    pub success_count: i32,
    pub consecutive_rate_limits: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub opened_at: Option<OffsetDateTime>,
    pub last_probe_at: Option<OffsetDateTime>,
    pub forced: bool,
}

/// Storage is used for bootstrap snapshots, per-request log+snapshot writes,
/// quota reseeds and breaker persistence. The request hot path never reads
/// from the database.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync, run once at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    async fn load_price_book(&self) -> StorageResult<PriceBookRows>;

    /// Insert the request log and its billing snapshot in one transaction;
    /// either both rows land or neither does. Returns the log row id.
    async fn record_request(
        &self,
        log: NewRequestLog,
        snapshot: NewBillingSnapshot,
    ) -> StorageResult<i64>;

    /// `SUM(final_cost)` of billed snapshots for one upstream in a window.
    async fn billed_cost_between(
        &self,
        upstream_id: i64,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> StorageResult<f64>;

    async fn persist_breaker_state(&self, row: BreakerPersist) -> StorageResult<()>;
}
