#![allow(clippy::needless_update)]

use rust_decimal::prelude::ToPrimitive;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, DatabaseBackend, DatabaseConnection, EntityTrait,
    FromQueryResult, QueryFilter, QuerySelect, Schema, TransactionTrait,
};
use time::OffsetDateTime;

use crate::db::connect_shared;
use crate::entities;
use crate::records::{NewBillingSnapshot, NewRequestLog};
use crate::snapshot::{
    ApiKeyRow, BreakerStateRow, CompensationRuleRow, PriceOverrideRow, PriceRow, StorageSnapshot,
    UpstreamRow,
};
use crate::storage::{BreakerPersist, PriceBookRows, Storage, StorageResult};

#[derive(Debug, FromQueryResult)]
struct CostSumRow {
    total: Option<rust_decimal::Decimal>,
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = connect_shared(dsn).await?;
        // Sqlite needs the pragma for cascade + set-null to actually fire.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            use sea_orm::ConnectionTrait;
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ApiKeys)
            .register(entities::Upstreams)
            .register(entities::CircuitBreakerStates)
            .register(entities::RequestLogs)
            .register(entities::RequestBillingSnapshots)
            .register(entities::BillingModelPrices)
            .register(entities::BillingManualPriceOverrides)
            .register(entities::CompensationRules)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let api_keys = entities::ApiKeys::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| {
                let allowed_upstream_ids: Vec<i64> =
                    serde_json::from_value(row.allowed_upstream_ids).unwrap_or_default();
                ApiKeyRow {
                    id: row.id,
                    key_hash: row.key_hash,
                    key_value_encrypted: row.key_value_encrypted,
                    key_prefix: row.key_prefix,
                    name: row.name,
                    active: row.active,
                    expires_at: row.expires_at,
                    allowed_upstream_ids,
                }
            })
            .collect();

        let upstreams = entities::Upstreams::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| UpstreamRow {
                id: row.id,
                name: row.name,
                base_url: row.base_url,
                api_key_encrypted: row.api_key_encrypted,
                priority: row.priority,
                weight: row.weight,
                route_capabilities: row.route_capabilities,
                allowed_models: row.allowed_models,
                model_redirects: row.model_redirects,
                billing_input_multiplier: row.billing_input_multiplier,
                billing_output_multiplier: row.billing_output_multiplier,
                spending_rules: row.spending_rules,
                affinity_migration: row.affinity_migration,
                timeout_sec: row.timeout_sec,
                active: row.active,
            })
            .collect();

        let breaker_states = entities::CircuitBreakerStates::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| BreakerStateRow {
                upstream_id: row.upstream_id,
                state: row.state,
                failure_count: row.failure_count,
                success_count: row.success_count,
                consecutive_rate_limits: row.consecutive_rate_limits,
                opened_at: row.opened_at,
                forced: row.forced,
            })
            .collect();

        let compensation_rules = entities::CompensationRules::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| CompensationRuleRow {
                id: row.id,
                capability: row.capability,
                header_name: row.header_name,
                action: row.action,
                source: row.source,
                enabled: row.enabled,
                built_in: row.built_in,
                rule_order: row.rule_order,
            })
            .collect();

        Ok(StorageSnapshot {
            api_keys,
            upstreams,
            breaker_states,
            compensation_rules,
        })
    }

    async fn load_price_book(&self) -> StorageResult<PriceBookRows> {
        let synced = entities::BillingModelPrices::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| PriceRow {
                model: row.model,
                source: row.source,
                input_price_per_million: row.input_price_per_million,
                output_price_per_million: row.output_price_per_million,
                cache_read_price_per_million: row.cache_read_price_per_million,
                cache_write_price_per_million: row.cache_write_price_per_million,
                is_active: row.is_active,
                synced_at: row.synced_at,
            })
            .collect();

        let overrides = entities::BillingManualPriceOverrides::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| PriceOverrideRow {
                model: row.model,
                input_price_per_million: row.input_price_per_million,
                output_price_per_million: row.output_price_per_million,
                cache_read_price_per_million: row.cache_read_price_per_million,
                cache_write_price_per_million: row.cache_write_price_per_million,
            })
            .collect();

        Ok(PriceBookRows { synced, overrides })
    }

    async fn record_request(
        &self,
        log: NewRequestLog,
        snapshot: NewBillingSnapshot,
    ) -> StorageResult<i64> {
        let routing_json = serde_json::to_value(&log.routing)?;
        let session_json = serde_json::to_value(&log.session)?;

        let txn = self.db.begin().await?;

        let log_row = entities::request_logs::ActiveModel {
            request_id: ActiveValue::Set(log.request_id),
            api_key_id: ActiveValue::Set(log.api_key_id),
            upstream_id: ActiveValue::Set(log.upstream_id),
            method: ActiveValue::Set(log.method),
            path: ActiveValue::Set(log.path),
            model: ActiveValue::Set(log.model),
            prompt_tokens: ActiveValue::Set(log.tokens.prompt as i64),
            completion_tokens: ActiveValue::Set(log.tokens.completion as i64),
            total_tokens: ActiveValue::Set(log.tokens.total as i64),
            cached_tokens: ActiveValue::Set(log.tokens.cached as i64),
            reasoning_tokens: ActiveValue::Set(log.tokens.reasoning as i64),
            cache_creation_tokens: ActiveValue::Set(log.tokens.cache_creation as i64),
            cache_read_tokens: ActiveValue::Set(log.tokens.cache_read as i64),
            status_code: ActiveValue::Set(log.status_code.map(i32::from)),
            duration_ms: ActiveValue::Set(log.duration_ms),
            routing_duration_ms: ActiveValue::Set(log.routing_duration_ms),
            ttft_ms: ActiveValue::Set(log.ttft_ms),
            is_stream: ActiveValue::Set(log.is_stream),
            error_message: ActiveValue::Set(log.error_message),
            routing_json: ActiveValue::Set(routing_json),
            session_json: ActiveValue::Set(session_json),
            header_diff_json: ActiveValue::Set(log.header_diff),
            created_at: ActiveValue::Set(log.created_at),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        entities::request_billing_snapshots::ActiveModel {
            request_log_id: ActiveValue::Set(log_row.id),
            upstream_id: ActiveValue::Set(snapshot.upstream_id),
            model: ActiveValue::Set(snapshot.model),
            input_price_per_million: ActiveValue::Set(snapshot.input_price_per_million),
            output_price_per_million: ActiveValue::Set(snapshot.output_price_per_million),
            cache_read_price_per_million: ActiveValue::Set(snapshot.cache_read_price_per_million),
            cache_write_price_per_million: ActiveValue::Set(snapshot.cache_write_price_per_million),
            input_multiplier: ActiveValue::Set(snapshot.input_multiplier),
            output_multiplier: ActiveValue::Set(snapshot.output_multiplier),
            prompt_tokens: ActiveValue::Set(snapshot.tokens.prompt as i64),
            completion_tokens: ActiveValue::Set(snapshot.tokens.completion as i64),
            cache_creation_tokens: ActiveValue::Set(snapshot.tokens.cache_creation as i64),
            cache_read_tokens: ActiveValue::Set(snapshot.tokens.cache_read as i64),
            final_cost: ActiveValue::Set(snapshot.final_cost),
            currency: ActiveValue::Set(snapshot.currency),
            billing_status: ActiveValue::Set(snapshot.billing_status.as_str().to_string()),
            unbillable_reason: ActiveValue::Set(
                snapshot.unbillable_reason.map(|r| r.as_str().to_string()),
            ),
            billed_at: ActiveValue::Set(snapshot.billed_at),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(log_row.id)
    }

    async fn billed_cost_between(
        &self,
        upstream_id: i64,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> StorageResult<f64> {
        use entities::request_billing_snapshots::Column;

        let row = entities::RequestBillingSnapshots::find()
            .select_only()
            .column_as(Column::FinalCost.sum(), "total")
            .filter(Column::UpstreamId.eq(upstream_id))
            .filter(Column::BillingStatus.eq("billed"))
            .filter(Column::BilledAt.gte(from))
            .filter(Column::BilledAt.lte(to))
            .into_model::<CostSumRow>()
            .one(&self.db)
            .await?;

        Ok(row
            .and_then(|r| r.total)
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0))
    }

    async fn persist_breaker_state(&self, row: BreakerPersist) -> StorageResult<()> {
        use entities::circuit_breaker_states::Column;

        let active = entities::circuit_breaker_states::ActiveModel {
            upstream_id: ActiveValue::Set(row.upstream_id),
            state: ActiveValue::Set(row.state.to_string()),
            failure_count: ActiveValue::Set(row.failure_count),
            success_count: ActiveValue::Set(row.success_count),
            consecutive_rate_limits: ActiveValue::Set(row.consecutive_rate_limits),
            last_failure_at: ActiveValue::Set(row.last_failure_at),
            opened_at: ActiveValue::Set(row.opened_at),
            last_probe_at: ActiveValue::Set(row.last_probe_at),
            forced: ActiveValue::Set(row.forced),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };

        entities::CircuitBreakerStates::insert(active)
            .on_conflict(
                OnConflict::column(Column::UpstreamId)
                    .update_columns([
                        Column::State,
                        Column::FailureCount,
                        Column::SuccessCount,
                        Column::ConsecutiveRateLimits,
                        Column::LastFailureAt,
                        Column::OpenedAt,
                        Column::LastProbeAt,
                        Column::Forced,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SeaOrmStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeaOrmStorage").finish_non_exhaustive()
    }
}
