use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_billing_snapshots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "billing_snapshot_log")]
    pub request_log_id: i64,
    /// Denormalized for quota reseeds; the log row carries the same id.
    pub upstream_id: Option<i64>,
    pub model: Option<String>,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
    pub input_multiplier: f64,
    pub output_multiplier: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    /// Final cost in `currency`, 6 decimal places.
    pub final_cost: Decimal,
    pub currency: String,
    /// billed | unbilled
    pub billing_status: String,
    pub unbillable_reason: Option<String>,
    pub billed_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "request_log_id", to = "id", on_delete = "Cascade")]
    pub request_log: HasOne<super::request_logs::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
