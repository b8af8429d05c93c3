pub mod db;
pub mod entities;
pub mod records;
pub mod seaorm;
pub mod snapshot;
pub mod storage;

pub use db::connect_shared;
pub use records::{
    BillingStatus, FailoverHop, NewBillingSnapshot, NewRequestLog, RoutingInfo, SessionInfo,
    UnbillableReason,
};
pub use seaorm::SeaOrmStorage;
pub use snapshot::{
    ApiKeyRow, BreakerStateRow, CompensationRuleRow, PriceOverrideRow, PriceRow, StorageSnapshot,
    UpstreamRow,
};
pub use storage::{BreakerPersist, PriceBookRows, Storage, StorageError, StorageResult};
