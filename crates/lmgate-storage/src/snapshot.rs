use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: i64,
    pub key_hash: String,
    pub key_value_encrypted: Option<String>,
    pub key_prefix: String,
    pub name: String,
    pub active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub allowed_upstream_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct UpstreamRow {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key_encrypted: String,
    pub priority: i16,
    pub weight: i32,
    pub route_capabilities: JsonValue,
    pub allowed_models: Option<JsonValue>,
    pub model_redirects: Option<JsonValue>,
    pub billing_input_multiplier: f64,
    pub billing_output_multiplier: f64,
    pub spending_rules: JsonValue,
    pub affinity_migration: Option<JsonValue>,
    pub timeout_sec: i64,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct BreakerStateRow {
    pub upstream_id: i64,
    pub state: String,
    pub failure_count: i32,
    pub success_count: i32,
    pub consecutive_rate_limits: i32,
    pub opened_at: Option<OffsetDateTime>,
    pub forced: bool,
}

#[derive(Debug, Clone)]
pub struct CompensationRuleRow {
    pub id: i64,
    pub capability: Option<String>,
    pub header_name: String,
    pub action: String,
    pub source: Option<JsonValue>,
    pub enabled: bool,
    pub built_in: bool,
    pub rule_order: i32,
}

#[derive(Debug, Clone)]
pub struct PriceRow {
    pub model: String,
    pub source: String,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
    pub is_active: bool,
    pub synced_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct PriceOverrideRow {
    pub model: String,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
}

/// Everything the runtime needs to serve requests, loaded once at bootstrap
/// and on reloads. Runtime reads never hit the database.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub api_keys: Vec<ApiKeyRow>,
    pub upstreams: Vec<UpstreamRow>,
    pub breaker_states: Vec<BreakerStateRow>,
    pub compensation_rules: Vec<CompensationRuleRow>,
}
