use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

use lmgate_protocol::TokenUsage;
use lmgate_storage::{BillingStatus, UnbillableReason};

use crate::pricing::PriceEntry;

#[derive(Debug, Clone)]
pub struct CostBreakdown {
    pub final_cost: f64,
    pub status: BillingStatus,
    pub unbillable_reason: Option<UnbillableReason>,
}

/// `(prompt·in + completion·out + cache_read·cr + cache_creation·cw) / 1e6`,
/// with the upstream's billing multipliers applied to the base terms. A
/// missing optional price zeroes its term; a missing base input or output
/// price makes the whole snapshot unbillable.
pub fn compute_cost(
    usage: &TokenUsage,
    price: Option<&PriceEntry>,
    input_multiplier: f64,
    output_multiplier: f64,
) -> CostBreakdown {
    let Some(price) = price else {
        return unbilled(UnbillableReason::NoPrice);
    };
    let (Some(input_price), Some(output_price)) = (
        price.input_price_per_million,
        price.output_price_per_million,
    ) else {
        return unbilled(UnbillableReason::NoPrice);
    };

    let cache_read_price = price.cache_read_price_per_million.unwrap_or(0.0);
    let cache_write_price = price.cache_write_price_per_million.unwrap_or(0.0);

    let final_cost = (usage.prompt as f64 * input_price * input_multiplier
        + usage.completion as f64 * output_price * output_multiplier
        + usage.cache_read as f64 * cache_read_price
        + usage.cache_creation as f64 * cache_write_price)
        / 1_000_000.0;

    CostBreakdown {
        final_cost,
        status: BillingStatus::Billed,
        unbillable_reason: None,
    }
}

fn unbilled(reason: UnbillableReason) -> CostBreakdown {
    CostBreakdown {
        final_cost: 0.0,
        status: BillingStatus::Unbilled,
        unbillable_reason: Some(reason),
    }
}

/// Persisted costs are decimal with 6 places; accumulation drift stays in
/// the f64 working value only.
pub fn to_persisted_cost(cost: f64) -> Decimal {
    Decimal::from_f64(cost).unwrap_or_default().round_dp(6)
}
