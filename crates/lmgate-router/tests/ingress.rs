use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tower::ServiceExt;

use lmgate_common::GatewayConfig;
use lmgate_core::ProxyEngine;
use lmgate_core::keystore::hash_api_key;
use lmgate_core::pricing::PriceBook;
use lmgate_core::state::AppState;
use lmgate_core::upstream_client::{
    OutboundBody, OutboundRequest, OutboundResponse, TransportError, UpstreamClient,
};
use lmgate_storage::{
    ApiKeyRow, BreakerPersist, NewBillingSnapshot, NewRequestLog, PriceBookRows, Storage,
    StorageResult, StorageSnapshot, UpstreamRow,
};

struct ScriptedResponse {
    status: u16,
    body: Bytes,
}

#[derive(Clone)]
struct ScriptedClient {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    seen: Arc<Mutex<Vec<OutboundRequest>>>,
}

impl ScriptedClient {
    fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, TransportError>> + Send + 'a>> {
        let next = self.responses.lock().unwrap().pop_front();
        self.seen.lock().unwrap().push(req);
        Box::pin(async move {
            let next = next.expect("scripted client ran out of responses");
            Ok(OutboundResponse {
                status: next.status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: OutboundBody::Bytes(next.body),
            })
        })
    }
}

#[derive(Default)]
struct NullStorage;

#[async_trait]
impl Storage for NullStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        Ok(StorageSnapshot::default())
    }
    async fn load_price_book(&self) -> StorageResult<PriceBookRows> {
        Ok(PriceBookRows::default())
    }
    async fn record_request(
        &self,
        _log: NewRequestLog,
        _snapshot: NewBillingSnapshot,
    ) -> StorageResult<i64> {
        Ok(1)
    }
    async fn billed_cost_between(
        &self,
        _upstream_id: i64,
        _from: OffsetDateTime,
        _to: OffsetDateTime,
    ) -> StorageResult<f64> {
        Ok(0.0)
    }
    async fn persist_breaker_state(&self, _row: BreakerPersist) -> StorageResult<()> {
        Ok(())
    }
}

fn config() -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        admin_token_hash: lmgate_core::bootstrap::hash_admin_token("admin-secret"),
        database_url: "postgres://test@localhost/test".to_string(),
        secret_key: None,
        allow_key_reveal: false,
        debug_log_headers: false,
        log_retention_days: 90,
        cors_origins: vec!["http://localhost:3000".to_string()],
        reconcile_interval_secs: 60,
    }
}

fn api_key_row(raw: &str, allowed: Vec<i64>) -> ApiKeyRow {
    ApiKeyRow {
        id: 1,
        key_hash: hash_api_key(raw),
        key_value_encrypted: None,
        key_prefix: raw.chars().take(8).collect(),
        name: "test-key".to_string(),
        active: true,
        expires_at: None,
        allowed_upstream_ids: allowed,
    }
}

fn upstream_row(id: i64, capabilities: Value) -> UpstreamRow {
    UpstreamRow {
        id,
        name: format!("upstream-{id}"),
        base_url: "https://upstream.example".to_string(),
        api_key_encrypted: "sk-upstream".to_string(),
        priority: 0,
        weight: 1,
        route_capabilities: capabilities,
        allowed_models: None,
        model_redirects: None,
        billing_input_multiplier: 1.0,
        billing_output_multiplier: 1.0,
        spending_rules: json!([]),
        affinity_migration: None,
        timeout_sec: 30,
        active: true,
    }
}

async fn test_app(
    upstreams: Vec<UpstreamRow>,
    responses: Vec<ScriptedResponse>,
) -> (axum::Router, ScriptedClient, Arc<AppState>) {
    let snapshot = StorageSnapshot {
        api_keys: vec![api_key_row("sk-downstream", vec![1, 2])],
        upstreams,
        breaker_states: vec![],
        compensation_rules: vec![],
    };
    let state = AppState::from_snapshot(
        config(),
        &snapshot,
        PriceBook::from_rows(&PriceBookRows::default()),
    )
    .await
    .unwrap();
    let client = ScriptedClient::new(responses);
    let storage: Arc<dyn Storage> = Arc::new(NullStorage);
    let engine = Arc::new(ProxyEngine::new(
        state.clone(),
        Arc::new(client.clone()),
        storage.clone(),
    ));
    let app = axum::Router::new()
        .merge(lmgate_router::proxy_router(engine))
        .nest("/admin", lmgate_router::admin_router(state.clone(), storage));
    (app, client, state)
}

fn chat_request(key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder
        .body(Body::from(
            serde_json::to_vec(&json!({ "model": "gpt-4o", "messages": [] })).unwrap(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let (app, _client, _state) = test_app(
        vec![upstream_row(1, json!(["openai.chat_completions"]))],
        vec![],
    )
    .await;
    let response = app.oneshot(chat_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_key_is_unauthorized() {
    let (app, _client, _state) = test_app(
        vec![upstream_row(1, json!(["openai.chat_completions"]))],
        vec![],
    )
    .await;
    let response = app.oneshot(chat_request(Some("sk-wrong"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_completions_roundtrip() {
    let (app, client, _state) = test_app(
        vec![upstream_row(1, json!(["openai.chat_completions"]))],
        vec![ScriptedResponse {
            status: 200,
            body: Bytes::from_static(b"{\"id\":\"chatcmpl-1\",\"usage\":null}"),
        }],
    )
    .await;

    let response = app
        .oneshot(chat_request(Some("sk-downstream")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "chatcmpl-1");

    let seen = client.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].url, "https://upstream.example/v1/chat/completions");
    // Downstream key replaced by the upstream credential.
    let auth = seen[0]
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
        .map(|(_, v)| v.clone())
        .unwrap();
    assert_eq!(auth, "Bearer sk-upstream");
}

#[tokio::test]
async fn provider_prefixed_path_is_stripped_for_upstream() {
    let (app, client, _state) = test_app(
        vec![upstream_row(1, json!(["anthropic.messages"]))],
        vec![ScriptedResponse {
            status: 200,
            body: Bytes::from_static(b"{\"id\":\"msg_1\"}"),
        }],
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/anthropic/v1/messages")
        .header("content-type", "application/json")
        .header("x-api-key", "sk-downstream")
        .body(Body::from(
            serde_json::to_vec(&json!({ "model": "claude-sonnet", "messages": [] })).unwrap(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = client.seen.lock().unwrap();
    assert_eq!(seen[0].url, "https://upstream.example/v1/messages");
    let has_x_api_key = seen[0]
        .headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("x-api-key") && v == "sk-upstream");
    assert!(has_x_api_key, "anthropic auth scheme uses x-api-key");
}

#[tokio::test]
async fn capability_mismatch_is_forbidden() {
    let (app, _client, _state) = test_app(
        vec![upstream_row(1, json!(["anthropic.messages"]))],
        vec![],
    )
    .await;
    let response = app
        .oneshot(chat_request(Some("sk-downstream")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn google_generate_attaches_query_credential() {
    let (app, client, _state) = test_app(
        vec![upstream_row(1, json!(["google.generate_content"]))],
        vec![ScriptedResponse {
            status: 200,
            body: Bytes::from_static(b"{\"candidates\":[]}"),
        }],
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1beta/models/gemini-2.0-flash:generateContent?key=sk-downstream")
        .header("content-type", "application/json")
        .body(Body::from(b"{\"contents\":[]}".to_vec()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = client.seen.lock().unwrap();
    assert!(
        seen[0].url.ends_with(":generateContent?key=sk-upstream"),
        "downstream key stripped, upstream key attached: {}",
        seen[0].url
    );
}

#[tokio::test]
async fn admin_requires_token() {
    let (app, _client, _state) = test_app(
        vec![upstream_row(1, json!(["openai.chat_completions"]))],
        vec![],
    )
    .await;

    let request = Request::builder()
        .uri("/admin/upstreams")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/admin/upstreams")
        .header("authorization", "Bearer admin-secret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["upstreams"][0]["id"], 1);
}

#[tokio::test]
async fn admin_can_force_breaker_open_and_close() {
    let (app, _client, state) = test_app(
        vec![upstream_row(1, json!(["openai.chat_completions"]))],
        vec![],
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/admin/upstreams/1/circuit-breaker")
        .header("authorization", "Bearer admin-secret")
        .header("content-type", "application/json")
        .body(Body::from(b"{\"action\":\"open\"}".to_vec()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.breaker.view(1).await.state, "open");

    let request = Request::builder()
        .method("POST")
        .uri("/admin/upstreams/1/circuit-breaker")
        .header("authorization", "Bearer admin-secret")
        .header("content-type", "application/json")
        .body(Body::from(b"{\"action\":\"close\"}".to_vec()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.breaker.view(1).await.state, "closed");
}

#[tokio::test]
async fn admin_reveal_respects_flag() {
    let (app, _client, _state) = test_app(
        vec![upstream_row(1, json!(["openai.chat_completions"]))],
        vec![],
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/admin/keys/1/reveal")
        .header("authorization", "Bearer admin-secret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "key_reveal_disabled");
}
