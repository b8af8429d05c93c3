use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "request_log_request_id")]
    pub request_id: String,
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub status_code: Option<i32>,
    pub duration_ms: i64,
    pub routing_duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    pub error_message: Option<String>,
    pub routing_json: Json,
    pub session_json: Json,
    pub header_diff_json: Option<Json>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "api_key_id", to = "id", on_delete = "SetNull")]
    pub api_key: HasOne<super::api_keys::Entity>,
    #[sea_orm(belongs_to, from = "upstream_id", to = "id", on_delete = "SetNull")]
    pub upstream: HasOne<super::upstreams::Entity>,
    #[sea_orm(has_many)]
    pub billing_snapshots: HasMany<super::request_billing_snapshots::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
