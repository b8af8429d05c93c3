use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "compensation_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Null matches every capability.
    pub capability: Option<String>,
    pub header_name: String,
    /// drop | replace | compensate_if_missing
    pub action: String,
    /// Source descriptor for replace/compensate actions.
    pub source: Option<Json>,
    pub enabled: bool,
    /// Built-in rules can be disabled but never deleted.
    pub built_in: bool,
    pub rule_order: i32,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
