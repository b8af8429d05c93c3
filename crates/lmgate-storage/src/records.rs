use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use lmgate_protocol::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Billed,
    Unbilled,
}

impl BillingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingStatus::Billed => "billed",
            BillingStatus::Unbilled => "unbilled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnbillableReason {
    NoPrice,
    NoUsage,
    ParseError,
}

impl UnbillableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnbillableReason::NoPrice => "no_price",
            UnbillableReason::NoUsage => "no_usage",
            UnbillableReason::ParseError => "parse_error",
        }
    }
}

/// One failed attempt in the failover chain, kept in the routing JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverHop {
    pub upstream_id: i64,
    pub upstream_name: String,
    /// UTC milliseconds.
    pub attempted_at: i64,
    pub error_type: String,
    pub error_message: String,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingInfo {
    /// weighted | affinity | probe
    pub routing_type: String,
    pub priority_tier: Option<i16>,
    pub failover_attempts: u32,
    pub failover_history: Vec<FailoverHop>,
    /// Full decision trace: candidates, masks with reasons, weights.
    pub decision: JsonValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Option<String>,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub compensated: bool,
}

#[derive(Debug, Clone)]
pub struct NewRequestLog {
    pub request_id: String,
    pub api_key_id: Option<i64>,
    pub upstream_id: Option<i64>,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub tokens: TokenUsage,
    pub status_code: Option<u16>,
    pub duration_ms: i64,
    pub routing_duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_stream: bool,
    pub error_message: Option<String>,
    pub routing: RoutingInfo,
    pub session: SessionInfo,
    pub header_diff: Option<JsonValue>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewBillingSnapshot {
    pub upstream_id: Option<i64>,
    pub model: Option<String>,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
    pub input_multiplier: f64,
    pub output_multiplier: f64,
    pub tokens: TokenUsage,
    pub final_cost: Decimal,
    pub currency: String,
    pub billing_status: BillingStatus,
    pub unbillable_reason: Option<UnbillableReason>,
    pub billed_at: OffsetDateTime,
}
