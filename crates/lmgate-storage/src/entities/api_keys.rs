use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "api_key_hash")]
    pub key_hash: String,
    /// AES-GCM sealed key value; legacy rows predate encryption and are null.
    pub key_value_encrypted: Option<String>,
    pub key_prefix: String,
    pub name: String,
    pub active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub allowed_upstream_ids: Json,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub request_logs: HasMany<super::request_logs::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
