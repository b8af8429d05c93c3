mod billing;

pub use billing::{CostBreakdown, compute_cost, to_persisted_cost};

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use time::OffsetDateTime;
use tokio::time::Instant;

use lmgate_common::Headers;
use lmgate_protocol::{
    Capability, ProviderFamily, SseParser, TokenUsage, UsageAccumulator, extract_token_usage,
};
use lmgate_storage::{
    FailoverHop, NewBillingSnapshot, NewRequestLog, RoutingInfo, SessionInfo, Storage,
    UnbillableReason,
};

use crate::affinity::{AffinityMetric, AffinityStore};
use crate::breaker::BreakerRegistry;
use crate::error::{ErrorKind, GatewayError};
use crate::headers::compensate;
use crate::keystore::ResolvedKey;
use crate::pricing::PriceCatalog;
use crate::quota::QuotaTracker;
use crate::router::{Attempt, RouteError, RoutePlan, RouteQuery};
use crate::state::AppState;
use crate::upstream_client::{HttpMethod, OutboundBody, OutboundRequest, UpstreamClient};
use crate::upstreams::UpstreamSpec;

/// Non-stream bodies are parsed for usage only up to this size.
const MAX_PARSED_BODY_BYTES: usize = 10 * 1024 * 1024;
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// One routed downstream request, already authenticated and classified.
#[derive(Debug)]
pub struct ProxyCall {
    pub auth: ResolvedKey,
    pub method: HttpMethod,
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
    pub capability: Capability,
    pub requested_model: Option<String>,
    pub is_stream: bool,
    pub session_id: Option<String>,
}

pub enum GatewayBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

pub struct GatewayResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: GatewayBody,
}

impl GatewayResponse {
    fn error(err: &GatewayError) -> Self {
        let body = serde_json::to_vec(&json!({
            "error": err.kind.as_str(),
            "message": err.message,
        }))
        .unwrap_or_default();
        Self {
            status: err.kind.status(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: GatewayBody::Bytes(Bytes::from(body)),
        }
    }
}

/// The per-request coordinator: routing, failover, header compensation, the
/// streaming tee, usage extraction and the final log + billing snapshot.
pub struct ProxyEngine {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
    storage: Arc<dyn Storage>,
}

impl ProxyEngine {
    pub fn new(
        state: Arc<AppState>,
        client: Arc<dyn UpstreamClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            state,
            client,
            storage,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn handle(&self, call: ProxyCall) -> GatewayResponse {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4();
        let request_seed = u64::from_le_bytes(
            request_id.as_bytes()[..8]
                .try_into()
                .unwrap_or([0u8; 8]),
        );
        let request_id = request_id.to_string();

        let query = RouteQuery {
            allowed_upstream_ids: call.auth.allowed_upstream_ids.clone(),
            capability: call.capability.clone(),
            requested_model: call.requested_model.clone(),
            session_id: call.session_id.clone(),
            request_seed,
        };

        let mut plan = match RoutePlan::new(self.state.router_context(), query) {
            Ok(plan) => plan,
            Err(_) => {
                let err = GatewayError::forbidden(
                    "api key has no upstream for the requested capability",
                );
                self.log_unrouted(&call, &request_id, &err, JsonValue::Null, started)
                    .await;
                return GatewayResponse::error(&err);
            }
        };

        let mut history: Vec<FailoverHop> = Vec::new();
        // Kept so an exhausted failover surfaces the last upstream answer
        // transparently instead of a synthetic error.
        let mut last_response: Option<(Attempt, u16, Headers, Bytes)> = None;

        loop {
            let attempt = match plan.next_attempt().await {
                Ok(attempt) => attempt,
                Err(RouteError::Exhausted { decision }) => {
                    if let Some((attempt, status, headers, body)) = last_response.take() {
                        return self
                            .surface_terminal_failure(
                                &call, &request_id, attempt, status, headers, body, &mut plan,
                                history, started,
                            )
                            .await;
                    }
                    let err = GatewayError::new(
                        ErrorKind::UpstreamUnavailable,
                        "no eligible upstream (breaker open or quota exceeded)",
                    );
                    self.log_unrouted(&call, &request_id, &err, decision, started)
                        .await;
                    return GatewayResponse::error(&err);
                }
                Err(RouteError::NoCandidates) => unreachable!("checked at plan construction"),
            };
            let routing_duration_ms = duration_ms(started);

            let credential = match self.state.secrets.open(&attempt.spec.api_key_encrypted) {
                Ok(credential) => credential,
                Err(err) => {
                    tracing::error!(
                        upstream = %attempt.spec.name,
                        error = %err,
                        "upstream credential cannot be decrypted"
                    );
                    history.push(failover_hop(
                        &attempt,
                        ErrorKind::ConfigurationError,
                        err.to_string(),
                        None,
                    ));
                    plan.exclude(attempt.spec.id);
                    continue;
                }
            };

            let rules = self.state.compensation_rules.load();
            let compensated = compensate(
                &call.capability,
                &call.headers,
                &rules,
                &credential,
                &request_id,
            );

            let (path, body) = rewrite_model(&call, &attempt);
            let url = build_url(
                &attempt.spec.base_url,
                &path,
                call.query.as_deref(),
                compensated.query_credential.as_ref(),
            );

            let outbound = OutboundRequest {
                method: call.method,
                url,
                headers: compensated.outbound,
                body: (!body.is_empty()).then(|| body.clone()),
                want_stream: call.is_stream,
            };

            let response =
                match tokio::time::timeout(attempt.spec.timeout, self.client.send(outbound)).await
                {
                    Err(_) => {
                        self.record_breaker_failure(attempt.spec.id).await;
                        history.push(failover_hop(
                            &attempt,
                            ErrorKind::UpstreamFailure,
                            "upstream deadline exceeded".to_string(),
                            None,
                        ));
                        plan.exclude(attempt.spec.id);
                        continue;
                    }
                    Ok(Err(transport)) => {
                        self.record_breaker_failure(attempt.spec.id).await;
                        history.push(failover_hop(
                            &attempt,
                            ErrorKind::UpstreamFailure,
                            transport.to_string(),
                            None,
                        ));
                        plan.exclude(attempt.spec.id);
                        continue;
                    }
                    Ok(Ok(response)) => response,
                };

            if response.status == 429 {
                if self.state.breaker.record_rate_limited(attempt.spec.id).await {
                    self.persist_breaker(attempt.spec.id);
                }
                history.push(failover_hop(
                    &attempt,
                    ErrorKind::UpstreamRateLimited,
                    "upstream rate limited".to_string(),
                    Some(429),
                ));
                plan.exclude(attempt.spec.id);
                if let OutboundBody::Bytes(bytes) = response.body {
                    last_response = Some((attempt, response.status, response.headers, bytes));
                }
                continue;
            }

            if response.status >= 500 {
                self.record_breaker_failure(attempt.spec.id).await;
                history.push(failover_hop(
                    &attempt,
                    ErrorKind::UpstreamFailure,
                    format!("upstream returned {}", response.status),
                    Some(response.status),
                ));
                plan.exclude(attempt.spec.id);
                if let OutboundBody::Bytes(bytes) = response.body {
                    last_response = Some((attempt, response.status, response.headers, bytes));
                }
                continue;
            }

            // Accepted. From here on failures can no longer retry.
            self.state.breaker.record_success(attempt.spec.id).await;
            self.persist_breaker(attempt.spec.id);
            if let Some(session) = call.session_id.as_deref() {
                self.state.affinity.establish(session, attempt.spec.id).await;
            }

            let finalizer = self.finalizer(
                &call,
                &request_id,
                &attempt,
                &plan,
                std::mem::take(&mut history),
                routing_duration_ms,
                started,
                Some(compensated.diff),
            );

            return match response.body {
                OutboundBody::Bytes(bytes) => {
                    self.relay_buffered(response.status, response.headers, bytes, finalizer)
                        .await
                }
                OutboundBody::Stream(rx) => {
                    self.relay_stream(response.status, response.headers, rx, finalizer)
                }
            };
        }
    }

    async fn relay_buffered(
        &self,
        status: u16,
        headers: Headers,
        bytes: Bytes,
        finalizer: Finalizer,
    ) -> GatewayResponse {
        let mut usage: Option<TokenUsage> = None;
        let mut parse_error = false;

        if (200..300).contains(&status) && bytes.len() <= MAX_PARSED_BODY_BYTES {
            match serde_json::from_slice::<JsonValue>(&bytes) {
                Ok(value) => {
                    let has_usage = value
                        .get("usage")
                        .map(|u| !u.is_null())
                        .unwrap_or(false);
                    if has_usage {
                        usage = Some(extract_token_usage(Some(&value)));
                    }
                }
                Err(_) => parse_error = true,
            }
        }

        finalizer
            .finalize(Outcome {
                status: Some(status),
                usage,
                parse_error,
                ttft_ms: None,
                response_len: bytes.len() as u64,
                error: None,
            })
            .await;

        GatewayResponse {
            status,
            headers,
            body: GatewayBody::Bytes(bytes),
        }
    }

    /// Tee the SSE stream: raw bytes go downstream verbatim while a parser
    /// copy extracts TTFT and the terminal usage event. Runs as its own task
    /// joined to the downstream writer by a bounded channel.
    fn relay_stream(
        &self,
        status: u16,
        mut headers: Headers,
        mut upstream_rx: tokio::sync::mpsc::Receiver<
            Result<Bytes, crate::upstream_client::TransportError>,
        >,
        finalizer: Finalizer,
    ) -> GatewayResponse {
        let (tx, rx_down) = tokio::sync::mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let breaker = self.state.breaker.clone();
        let storage = self.storage.clone();
        let started = finalizer.started;
        let upstream_id = finalizer.upstream.as_ref().map(|u| u.id);

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut usage = UsageAccumulator::new();
            let mut ttft_ms: Option<i64> = None;
            let mut response_len: u64 = 0;
            let mut client_gone = false;
            let mut abort_message: Option<String> = None;

            while let Some(item) = upstream_rx.recv().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        abort_message = Some(err.to_string());
                        break;
                    }
                };
                for event in parser.push(&chunk) {
                    if ttft_ms.is_none() {
                        ttft_ms = Some(duration_ms(started));
                    }
                    if event.is_done_marker() {
                        continue;
                    }
                    if let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) {
                        usage.observe_event(event.event.as_deref(), &value);
                    }
                }
                response_len += chunk.len() as u64;
                if tx.send(chunk).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            if !client_gone && abort_message.is_none() {
                for event in parser.finish() {
                    if event.is_done_marker() {
                        continue;
                    }
                    if let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) {
                        usage.observe_event(event.event.as_deref(), &value);
                    }
                }
            }

            let usage = usage.finalize();
            let error = if client_gone {
                Some((
                    ErrorKind::ClientDisconnect,
                    "client disconnected mid-stream".to_string(),
                ))
            } else if let Some(message) = abort_message {
                // Aborted before the terminal usage event counts against the
                // breaker; the downstream stream is already truncated.
                if usage.is_none()
                    && let Some(id) = upstream_id
                {
                    breaker.record_failure(id).await;
                    let row = finalizer.breaker.persist_row(id).await;
                    let storage = storage.clone();
                    tokio::spawn(async move {
                        if let Err(err) = storage.persist_breaker_state(row).await {
                            tracing::warn!(error = %err, "breaker persistence failed");
                        }
                    });
                }
                Some((ErrorKind::UpstreamFailure, message))
            } else {
                None
            };

            finalizer
                .finalize(Outcome {
                    status: Some(status),
                    usage,
                    parse_error: false,
                    ttft_ms,
                    response_len,
                    error,
                })
                .await;
        });

        if lmgate_common::header_get(&headers, "content-type").is_none() {
            lmgate_common::header_set(&mut headers, "content-type", "text/event-stream");
        }
        GatewayResponse {
            status,
            headers,
            body: GatewayBody::Stream(rx_down),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn surface_terminal_failure(
        &self,
        call: &ProxyCall,
        request_id: &str,
        attempt: Attempt,
        status: u16,
        headers: Headers,
        body: Bytes,
        plan: &mut RoutePlan,
        history: Vec<FailoverHop>,
        started: Instant,
    ) -> GatewayResponse {
        let kind = if status == 429 {
            ErrorKind::UpstreamRateLimited
        } else {
            ErrorKind::UpstreamFailure
        };
        let finalizer = self.finalizer(
            call,
            request_id,
            &attempt,
            plan,
            history,
            duration_ms(started),
            started,
            None,
        );
        finalizer
            .finalize(Outcome {
                status: Some(status),
                usage: None,
                parse_error: false,
                ttft_ms: None,
                response_len: body.len() as u64,
                error: Some((kind, format!("all failover attempts exhausted ({status})"))),
            })
            .await;

        GatewayResponse {
            status,
            headers,
            body: GatewayBody::Bytes(body),
        }
    }

    async fn record_breaker_failure(&self, upstream_id: i64) {
        self.state.breaker.record_failure(upstream_id).await;
        self.persist_breaker(upstream_id);
    }

    fn persist_breaker(&self, upstream_id: i64) {
        let breaker = self.state.breaker.clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            let row = breaker.persist_row(upstream_id).await;
            if let Err(err) = storage.persist_breaker_state(row).await {
                tracing::warn!(upstream_id, error = %err, "breaker persistence failed");
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn finalizer(
        &self,
        call: &ProxyCall,
        request_id: &str,
        attempt: &Attempt,
        plan: &RoutePlan,
        history: Vec<FailoverHop>,
        routing_duration_ms: i64,
        started: Instant,
        header_diff: Option<crate::headers::HeaderDiff>,
    ) -> Finalizer {
        let compensated = header_diff
            .as_ref()
            .map(|diff| !diff.compensated.is_empty())
            .unwrap_or(false);
        let debug_headers = self.state.config.load().debug_log_headers;
        Finalizer {
            storage: self.storage.clone(),
            quota: self.state.quota.clone(),
            affinity: self.state.affinity.clone(),
            catalog: self.state.catalog.clone(),
            breaker: self.state.breaker.clone(),
            request_id: request_id.to_string(),
            api_key_id: Some(call.auth.api_key_id),
            method: call.method.as_str().to_string(),
            path: call.path.clone(),
            model: attempt
                .outbound_model
                .clone()
                .or_else(|| call.requested_model.clone()),
            upstream: Some(attempt.spec.clone()),
            is_stream: call.is_stream,
            session: SessionInfo {
                id: call.session_id.clone(),
                affinity_hit: attempt.affinity_hit,
                affinity_migrated: attempt.affinity_migrated,
                compensated,
            },
            routing: RoutingInfo {
                routing_type: attempt.routing_type.to_string(),
                priority_tier: Some(attempt.tier),
                failover_attempts: plan.attempts_made().saturating_sub(1),
                failover_history: history,
                decision: plan.decision_trace(),
            },
            header_diff: header_diff
                .filter(|_| debug_headers)
                .and_then(|diff| serde_json::to_value(diff).ok()),
            started,
            routing_duration_ms,
        }
    }

    async fn log_unrouted(
        &self,
        call: &ProxyCall,
        request_id: &str,
        err: &GatewayError,
        decision: JsonValue,
        started: Instant,
    ) {
        let finalizer = Finalizer {
            storage: self.storage.clone(),
            quota: self.state.quota.clone(),
            affinity: self.state.affinity.clone(),
            catalog: self.state.catalog.clone(),
            breaker: self.state.breaker.clone(),
            request_id: request_id.to_string(),
            api_key_id: Some(call.auth.api_key_id),
            method: call.method.as_str().to_string(),
            path: call.path.clone(),
            model: call.requested_model.clone(),
            upstream: None,
            is_stream: call.is_stream,
            session: SessionInfo {
                id: call.session_id.clone(),
                ..SessionInfo::default()
            },
            routing: RoutingInfo {
                routing_type: "none".to_string(),
                priority_tier: None,
                failover_attempts: 0,
                failover_history: Vec::new(),
                decision,
            },
            header_diff: None,
            started,
            routing_duration_ms: duration_ms(started),
        };
        finalizer
            .finalize(Outcome {
                status: Some(err.kind.status()),
                usage: None,
                parse_error: false,
                ttft_ms: None,
                response_len: 0,
                error: Some((err.kind, err.message.clone())),
            })
            .await;
    }
}

struct Outcome {
    status: Option<u16>,
    usage: Option<TokenUsage>,
    parse_error: bool,
    ttft_ms: Option<i64>,
    response_len: u64,
    error: Option<(ErrorKind, String)>,
}

/// Owns everything needed to close out a request: cost computation, quota
/// and affinity updates, and the transactional log + snapshot write.
struct Finalizer {
    storage: Arc<dyn Storage>,
    quota: Arc<QuotaTracker>,
    affinity: Arc<AffinityStore>,
    catalog: Arc<PriceCatalog>,
    breaker: Arc<BreakerRegistry>,
    request_id: String,
    api_key_id: Option<i64>,
    method: String,
    path: String,
    model: Option<String>,
    upstream: Option<Arc<UpstreamSpec>>,
    is_stream: bool,
    session: SessionInfo,
    routing: RoutingInfo,
    header_diff: Option<JsonValue>,
    started: Instant,
    routing_duration_ms: i64,
}

impl Finalizer {
    async fn finalize(self, outcome: Outcome) {
        let now = OffsetDateTime::now_utc();
        let tokens = outcome.usage.unwrap_or_default();

        let price = self
            .model
            .as_deref()
            .and_then(|model| self.catalog.price_of(model));
        let (input_multiplier, output_multiplier) = self
            .upstream
            .as_ref()
            .map(|u| (u.billing_input_multiplier, u.billing_output_multiplier))
            .unwrap_or((1.0, 1.0));

        let breakdown = if outcome.parse_error {
            CostBreakdown {
                final_cost: 0.0,
                status: lmgate_storage::BillingStatus::Unbilled,
                unbillable_reason: Some(UnbillableReason::ParseError),
            }
        } else if outcome.usage.is_none() {
            CostBreakdown {
                final_cost: 0.0,
                status: lmgate_storage::BillingStatus::Unbilled,
                unbillable_reason: Some(UnbillableReason::NoUsage),
            }
        } else {
            compute_cost(&tokens, price.as_ref(), input_multiplier, output_multiplier)
        };

        if let Some(upstream) = self.upstream.as_ref() {
            if breakdown.final_cost > 0.0 {
                self.quota
                    .record_spending(upstream.id, breakdown.final_cost)
                    .await;
            }
            if let (Some(session_id), Some(policy)) =
                (self.session.id.as_deref(), upstream.affinity_migration)
            {
                let amount = match policy.metric {
                    AffinityMetric::Tokens => tokens.total,
                    AffinityMetric::Length => outcome.response_len,
                };
                self.affinity.record_metric(session_id, amount).await;
            }
        }

        let log = NewRequestLog {
            request_id: self.request_id,
            api_key_id: self.api_key_id,
            upstream_id: self.upstream.as_ref().map(|u| u.id),
            method: self.method,
            path: self.path,
            model: self.model.clone(),
            tokens,
            status_code: outcome.status,
            duration_ms: duration_ms(self.started),
            routing_duration_ms: self.routing_duration_ms,
            ttft_ms: outcome.ttft_ms,
            is_stream: self.is_stream,
            error_message: outcome
                .error
                .map(|(kind, message)| format!("{}: {message}", kind.as_str())),
            routing: self.routing,
            session: self.session,
            header_diff: self.header_diff,
            created_at: now,
        };
        let snapshot = NewBillingSnapshot {
            upstream_id: self.upstream.as_ref().map(|u| u.id),
            model: self.model,
            input_price_per_million: price.as_ref().and_then(|p| p.input_price_per_million),
            output_price_per_million: price.as_ref().and_then(|p| p.output_price_per_million),
            cache_read_price_per_million: price
                .as_ref()
                .and_then(|p| p.cache_read_price_per_million),
            cache_write_price_per_million: price
                .as_ref()
                .and_then(|p| p.cache_write_price_per_million),
            input_multiplier,
            output_multiplier,
            tokens,
            final_cost: to_persisted_cost(breakdown.final_cost),
            currency: "USD".to_string(),
            billing_status: breakdown.status,
            unbillable_reason: breakdown.unbillable_reason,
            billed_at: now,
        };

        let storage = self.storage;
        tokio::spawn(async move {
            if let Err(err) = storage.record_request(log, snapshot).await {
                tracing::error!(error = %err, "request log write failed");
            }
        });
    }
}

fn duration_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

fn failover_hop(
    attempt: &Attempt,
    kind: ErrorKind,
    message: String,
    status_code: Option<u16>,
) -> FailoverHop {
    FailoverHop {
        upstream_id: attempt.spec.id,
        upstream_name: attempt.spec.name.clone(),
        attempted_at: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
        error_type: kind.as_str().to_string(),
        error_message: message,
        status_code,
    }
}

/// Apply the upstream's model redirect to the outbound request. OpenAI and
/// Anthropic carry the model in the JSON body; Google carries it in the
/// path.
fn rewrite_model(call: &ProxyCall, attempt: &Attempt) -> (String, Bytes) {
    let Some(requested) = call.requested_model.as_deref() else {
        return (call.path.clone(), call.body.clone());
    };
    let Some(outbound) = attempt.outbound_model.as_deref() else {
        return (call.path.clone(), call.body.clone());
    };
    if outbound == requested {
        return (call.path.clone(), call.body.clone());
    }

    if call.capability.family() == ProviderFamily::Google {
        let path = call.path.replacen(
            &format!("models/{requested}"),
            &format!("models/{outbound}"),
            1,
        );
        return (path, call.body.clone());
    }

    let Ok(mut value) = serde_json::from_slice::<JsonValue>(&call.body) else {
        return (call.path.clone(), call.body.clone());
    };
    let Some(obj) = value.as_object_mut() else {
        return (call.path.clone(), call.body.clone());
    };
    obj.insert(
        "model".to_string(),
        JsonValue::String(outbound.to_string()),
    );
    let body = serde_json::to_vec(&value)
        .map(Bytes::from)
        .unwrap_or_else(|_| call.body.clone());
    (call.path.clone(), body)
}

fn build_url(
    base_url: &str,
    path: &str,
    query: Option<&str>,
    query_credential: Option<&(String, String)>,
) -> String {
    let mut url = format!("{base_url}{path}");
    let mut separator = '?';
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push(separator);
        url.push_str(query);
        separator = '&';
    }
    if let Some((key, value)) = query_credential {
        url.push(separator);
        url.push_str(key);
        url.push('=');
        url.push_str(&urlencode(value));
    }
    url
}

fn urlencode(value: &str) -> String {
    serde_urlencoded::to_string([("k", value)])
        .map(|s| s.trim_start_matches("k=").to_string())
        .unwrap_or_else(|_| value.to_string())
}
