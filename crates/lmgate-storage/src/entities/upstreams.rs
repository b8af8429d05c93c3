use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstreams")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "upstream_name")]
    pub name: String,
    pub base_url: String,
    pub api_key_encrypted: String,
    /// 0-100, lower number = higher tier.
    pub priority: i16,
    /// 1-100, relative pick weight inside a tier.
    pub weight: i32,
    pub route_capabilities: Json,
    pub allowed_models: Option<Json>,
    pub model_redirects: Option<Json>,
    pub billing_input_multiplier: f64,
    pub billing_output_multiplier: f64,
    pub spending_rules: Json,
    pub affinity_migration: Option<Json>,
    pub timeout_sec: i64,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub request_logs: HasMany<super::request_logs::Entity>,
    #[sea_orm(has_many)]
    pub circuit_breaker_states: HasMany<super::circuit_breaker_states::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
