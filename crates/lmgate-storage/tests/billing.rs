use rust_decimal::Decimal;
use time::{Duration, OffsetDateTime};

use lmgate_protocol::TokenUsage;
use lmgate_storage::{
    BillingStatus, NewBillingSnapshot, NewRequestLog, RoutingInfo, SeaOrmStorage, SessionInfo,
    Storage, UnbillableReason,
};

async fn test_storage() -> SeaOrmStorage {
    let storage = SeaOrmStorage::connect("sqlite::memory:?cache=shared")
        .await
        .unwrap();
    storage.sync().await.unwrap();
    storage
}

fn sample_log(request_id: &str, upstream_id: Option<i64>) -> NewRequestLog {
    NewRequestLog {
        request_id: request_id.to_string(),
        api_key_id: None,
        upstream_id,
        method: "POST".to_string(),
        path: "/v1/chat/completions".to_string(),
        model: Some("gpt-4o".to_string()),
        tokens: TokenUsage {
            prompt: 100,
            completion: 20,
            total: 120,
            ..TokenUsage::default()
        },
        status_code: Some(200),
        duration_ms: 812,
        routing_duration_ms: 2,
        ttft_ms: Some(145),
        is_stream: true,
        error_message: None,
        routing: RoutingInfo {
            routing_type: "weighted".to_string(),
            priority_tier: Some(0),
            failover_attempts: 0,
            failover_history: Vec::new(),
            decision: serde_json::json!({ "tier": 0 }),
        },
        session: SessionInfo::default(),
        header_diff: None,
        created_at: OffsetDateTime::now_utc(),
    }
}

fn sample_snapshot(upstream_id: Option<i64>, cost: &str) -> NewBillingSnapshot {
    NewBillingSnapshot {
        upstream_id,
        model: Some("gpt-4o".to_string()),
        input_price_per_million: Some(2.5),
        output_price_per_million: Some(10.0),
        cache_read_price_per_million: None,
        cache_write_price_per_million: None,
        input_multiplier: 1.0,
        output_multiplier: 1.0,
        tokens: TokenUsage {
            prompt: 100,
            completion: 20,
            total: 120,
            ..TokenUsage::default()
        },
        final_cost: cost.parse::<Decimal>().unwrap(),
        currency: "USD".to_string(),
        billing_status: BillingStatus::Billed,
        unbillable_reason: None,
        billed_at: OffsetDateTime::now_utc(),
    }
}

#[tokio::test]
async fn log_and_snapshot_land_together() {
    let storage = test_storage().await;
    let id = storage
        .record_request(sample_log("req-1", Some(7)), sample_snapshot(Some(7), "0.00045"))
        .await
        .unwrap();
    assert!(id > 0);

    let billed = storage
        .billed_cost_between(
            7,
            OffsetDateTime::now_utc() - Duration::hours(1),
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert!((billed - 0.00045).abs() < 1e-9);
}

#[tokio::test]
async fn unbilled_snapshots_do_not_count_toward_spending() {
    let storage = test_storage().await;

    let mut unbilled = sample_snapshot(Some(3), "0");
    unbilled.billing_status = BillingStatus::Unbilled;
    unbilled.unbillable_reason = Some(UnbillableReason::NoPrice);
    storage
        .record_request(sample_log("req-2", Some(3)), unbilled)
        .await
        .unwrap();

    storage
        .record_request(sample_log("req-3", Some(3)), sample_snapshot(Some(3), "1.25"))
        .await
        .unwrap();

    let billed = storage
        .billed_cost_between(
            3,
            OffsetDateTime::now_utc() - Duration::hours(1),
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert!((billed - 1.25).abs() < 1e-9);
}

#[tokio::test]
async fn duplicate_request_id_aborts_both_rows() {
    let storage = test_storage().await;
    storage
        .record_request(sample_log("req-dup", Some(1)), sample_snapshot(Some(1), "0.5"))
        .await
        .unwrap();

    // Second insert with the same request id violates the unique key; the
    // snapshot insert must roll back with it.
    let err = storage
        .record_request(sample_log("req-dup", Some(1)), sample_snapshot(Some(1), "0.5"))
        .await;
    assert!(err.is_err());

    let billed = storage
        .billed_cost_between(
            1,
            OffsetDateTime::now_utc() - Duration::hours(1),
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert!((billed - 0.5).abs() < 1e-9, "only the first snapshot counts");
}
