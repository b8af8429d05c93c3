use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

use lmgate_core::AppState;
use lmgate_core::keystore::RevealError;
use lmgate_storage::Storage;

#[derive(Clone)]
struct AdminState {
    state: Arc<AppState>,
    storage: Arc<dyn Storage>,
}

pub fn admin_router(state: Arc<AppState>, storage: Arc<dyn Storage>) -> Router {
    let cors = cors_layer(&state);
    let admin = AdminState { state, storage };

    Router::new()
        .route("/upstreams", get(list_upstreams))
        .route("/upstreams/{id}/circuit-breaker", post(force_circuit_breaker))
        .route("/upstreams/{id}/quota", get(quota_status))
        .route("/keys/{id}/reveal", post(reveal_key))
        .layer(middleware::from_fn_with_state(admin.clone(), admin_auth))
        .layer(cors)
        .with_state(admin)
}

fn cors_layer(state: &Arc<AppState>) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .load()
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

async fn admin_auth(
    State(admin): State<AdminState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let expected = admin.state.config.load().admin_token_hash.clone();
    if lmgate_core::bootstrap::hash_admin_token(presented) != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

async fn list_upstreams(State(admin): State<AdminState>) -> Response {
    let mut out = Vec::new();
    let mut specs = admin.state.upstreams.all();
    specs.sort_by_key(|spec| spec.id);
    for spec in specs {
        let breaker = admin.state.breaker.view(spec.id).await;
        let quota = admin.state.quota.status(spec.id).await;
        out.push(serde_json::json!({
            "id": spec.id,
            "name": spec.name,
            "base_url": spec.base_url,
            "priority": spec.priority,
            "weight": spec.weight,
            "active": spec.active,
            "capabilities": spec.capabilities,
            "circuit_breaker": breaker,
            "quota_exceeded": quota.is_exceeded,
        }));
    }
    Json(serde_json::json!({ "upstreams": out })).into_response()
}

#[derive(Debug, Deserialize)]
struct BreakerAction {
    action: String,
}

async fn force_circuit_breaker(
    State(admin): State<AdminState>,
    Path(id): Path<i64>,
    Json(body): Json<BreakerAction>,
) -> Response {
    if admin.state.upstreams.get(id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown_upstream").into_response();
    }
    match body.action.as_str() {
        "open" => admin.state.breaker.force_open(id).await,
        "close" => admin.state.breaker.force_close(id).await,
        _ => return (StatusCode::BAD_REQUEST, "unknown_action").into_response(),
    }

    let row = admin.state.breaker.persist_row(id).await;
    if let Err(err) = admin.storage.persist_breaker_state(row).await {
        tracing::warn!(upstream_id = id, error = %err, "breaker persistence failed");
    }

    let view = admin.state.breaker.view(id).await;
    Json(serde_json::json!({ "id": id, "circuit_breaker": view })).into_response()
}

async fn quota_status(State(admin): State<AdminState>, Path(id): Path<i64>) -> Response {
    if admin.state.upstreams.get(id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown_upstream").into_response();
    }
    let status = admin.state.quota.status(id).await;
    Json(status).into_response()
}

async fn reveal_key(State(admin): State<AdminState>, Path(id): Path<i64>) -> Response {
    match admin.state.keystore.reveal(id) {
        Ok(value) => Json(serde_json::json!({ "id": id, "key_value": value })).into_response(),
        Err(RevealError::Disabled) => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "key_reveal_disabled" })),
        )
            .into_response(),
        Err(RevealError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "key_not_found" })),
        )
            .into_response(),
        Err(RevealError::LegacyKey) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "legacy_key" })),
        )
            .into_response(),
        Err(RevealError::Secret(err)) => {
            tracing::error!(key_id = id, error = %err, "key reveal decryption failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "decryption_failed" })),
            )
                .into_response()
        }
    }
}
