use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use lmgate_core::engine::{GatewayBody, GatewayResponse, ProxyCall, ProxyEngine};
use lmgate_core::keystore::ResolvedKey;
use lmgate_core::upstream_client::HttpMethod;
use lmgate_protocol::Capability;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
}

pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = ProxyState { engine };

    Router::new()
        // OpenAI-family surface
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/responses", post(openai_responses))
        .route("/v1/embeddings", post(openai_embeddings))
        .route("/openai/v1/chat/completions", post(openai_chat_completions))
        .route("/openai/v1/responses", post(openai_responses))
        .route("/openai/v1/embeddings", post(openai_embeddings))
        // Anthropic-family surface
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(anthropic_count_tokens))
        .route("/anthropic/v1/messages", post(anthropic_messages))
        .route(
            "/anthropic/v1/messages/count_tokens",
            post(anthropic_count_tokens),
        )
        // Google-family surface (generateContent / streamGenerateContent)
        .route("/v1beta/models/{*model_action}", post(google_generate))
        .route("/google/v1beta/models/{*model_action}", post(google_generate))
        .layer(middleware::from_fn_with_state(state.clone(), gateway_auth))
        .with_state(state)
}

async fn gateway_auth(
    State(state): State<ProxyState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let key = extract_api_key(req.headers(), req.uri().query());

    // Never forward downstream auth material, whether auth succeeds or not.
    strip_auth_query(req.uri_mut());

    let Some(key) = key else {
        return Err(unauthorized("missing api key"));
    };
    let resolved = match state.engine.state().keystore.resolve(&key) {
        Ok(resolved) => resolved,
        Err(err) => return Err(unauthorized(&err.message)),
    };

    req.extensions_mut().insert(resolved);
    Ok(next.run(req).await)
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": "unauthorized", "message": message })),
    )
        .into_response()
}

fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        let prefix = "Bearer ";
        if s.len() > prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = s[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(s) = value.to_str()
        {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }

    let q = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok()?;
    pairs
        .into_iter()
        .find(|(k, _)| k == "key")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn strip_auth_query(uri: &mut axum::http::Uri) {
    let Some(q) = uri.query() else { return };
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q) else {
        return;
    };
    let filtered: Vec<(String, String)> = pairs.into_iter().filter(|(k, _)| k != "key").collect();
    let new_q = match serde_urlencoded::to_string(&filtered) {
        Ok(s) => s,
        Err(_) => return,
    };
    let path = uri.path();
    let new_uri = if new_q.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_q}")
    };
    if let Ok(new_uri) = new_uri.parse() {
        *uri = new_uri;
    }
}

/// The affinity session id rides on `x-session-id`, with a cookie fallback
/// for clients that cannot set custom headers.
fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-session-id")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == "session_id").then(|| v.trim().to_string())
    })
}

fn headers_to_vec(headers: &HeaderMap) -> lmgate_common::Headers {
    let mut out = Vec::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

/// Outbound path is the inbound path minus any provider prefix.
fn upstream_path(path: &str) -> String {
    for prefix in ["/openai", "/anthropic", "/google"] {
        if let Some(rest) = path.strip_prefix(prefix)
            && rest.starts_with('/')
        {
            return rest.to_string();
        }
    }
    path.to_string()
}

fn json_body(body: &Bytes) -> Option<serde_json::Value> {
    serde_json::from_slice(body).ok()
}

fn model_from_body(body: &Bytes) -> Option<String> {
    json_body(body)?
        .get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

fn stream_from_body(body: &Bytes) -> bool {
    json_body(body)
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

async fn forward(
    state: ProxyState,
    auth: ResolvedKey,
    capability: Capability,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    requested_model: Option<String>,
    is_stream: bool,
) -> Response {
    let call = ProxyCall {
        auth,
        method: HttpMethod::Post,
        path: upstream_path(&path),
        query,
        headers: headers_to_vec(&headers),
        body,
        capability,
        requested_model,
        is_stream,
        session_id: extract_session_id(&headers),
    };
    to_axum_response(state.engine.handle(call).await)
}

macro_rules! body_routed_handler {
    ($name:ident, $capability:expr) => {
        async fn $name(
            State(state): State<ProxyState>,
            Extension(auth): Extension<ResolvedKey>,
            uri: axum::http::Uri,
            RawQuery(query): RawQuery,
            headers: HeaderMap,
            body: Bytes,
        ) -> Response {
            let model = model_from_body(&body);
            let is_stream = stream_from_body(&body);
            forward(
                state,
                auth,
                $capability,
                uri.path().to_string(),
                query,
                headers,
                body,
                model,
                is_stream,
            )
            .await
        }
    };
}

body_routed_handler!(openai_chat_completions, Capability::OpenAiChatCompletions);
body_routed_handler!(openai_responses, Capability::OpenAiResponses);
body_routed_handler!(anthropic_messages, Capability::AnthropicMessages);

async fn openai_embeddings(
    State(state): State<ProxyState>,
    Extension(auth): Extension<ResolvedKey>,
    uri: axum::http::Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model = model_from_body(&body);
    forward(
        state,
        auth,
        Capability::OpenAiEmbeddings,
        uri.path().to_string(),
        query,
        headers,
        body,
        model,
        false,
    )
    .await
}

async fn anthropic_count_tokens(
    State(state): State<ProxyState>,
    Extension(auth): Extension<ResolvedKey>,
    uri: axum::http::Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model = model_from_body(&body);
    forward(
        state,
        auth,
        Capability::AnthropicCountTokens,
        uri.path().to_string(),
        query,
        headers,
        body,
        model,
        false,
    )
    .await
}

async fn google_generate(
    State(state): State<ProxyState>,
    Extension(auth): Extension<ResolvedKey>,
    uri: axum::http::Uri,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = split_model_action(&model_action) else {
        return (StatusCode::BAD_REQUEST, "bad_model_action").into_response();
    };
    let capability = match action {
        "generateContent" => Capability::GoogleGenerateContent,
        "streamGenerateContent" => Capability::GoogleStreamGenerateContent,
        _ => return (StatusCode::NOT_FOUND, "unknown_action").into_response(),
    };
    let is_stream = capability == Capability::GoogleStreamGenerateContent;
    forward(
        state,
        auth,
        capability,
        uri.path().to_string(),
        query,
        headers,
        body,
        Some(model.to_string()),
        is_stream,
    )
    .await
}

fn split_model_action(raw: &str) -> Option<(&str, &str)> {
    let raw = raw.trim_start_matches('/');
    let (model, action) = raw.split_once(':')?;
    let model = model.trim();
    let action = action.trim();
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some((model, action))
}

fn to_axum_response(resp: GatewayResponse) -> Response {
    let is_sse = resp
        .headers
        .iter()
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("content-type")
                && value.to_ascii_lowercase().contains("text/event-stream")
        })
        && matches!(resp.body, GatewayBody::Stream(_));

    let mut builder = Response::builder().status(resp.status);
    if let Some(h) = builder.headers_mut() {
        for (k, v) in resp.headers {
            // Hyper owns framing; hop-by-hop headers never pass through.
            if is_hop_by_hop_or_framing_header(&k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                h.append(name, value);
            }
        }
        if is_sse {
            // Keep intermediaries from buffering the event stream.
            h.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            h.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let body = match resp.body {
        GatewayBody::Bytes(bytes) => Body::from(bytes),
        GatewayBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            Body::from_stream(stream)
        }
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_path_strips_provider_prefixes() {
        assert_eq!(upstream_path("/anthropic/v1/messages"), "/v1/messages");
        assert_eq!(upstream_path("/openai/v1/responses"), "/v1/responses");
        assert_eq!(
            upstream_path("/google/v1beta/models/g:generateContent"),
            "/v1beta/models/g:generateContent"
        );
        assert_eq!(upstream_path("/v1/chat/completions"), "/v1/chat/completions");
        // Only whole path segments count as prefixes.
        assert_eq!(upstream_path("/openaiish/v1/x"), "/openaiish/v1/x");
    }

    #[test]
    fn api_key_extraction_order() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk-bearer".parse().unwrap());
        headers.insert("x-api-key", "sk-xapi".parse().unwrap());
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("sk-bearer"));

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "sk-goog".parse().unwrap());
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("sk-goog"));

        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, Some("alt=sse&key=sk-query")).as_deref(),
            Some("sk-query")
        );
        assert_eq!(extract_api_key(&headers, None), None);
    }

    #[test]
    fn session_id_header_then_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "sess-h".parse().unwrap());
        headers.insert(header::COOKIE, "session_id=sess-c".parse().unwrap());
        assert_eq!(extract_session_id(&headers).as_deref(), Some("sess-h"));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "a=b; session_id=sess-c".parse().unwrap());
        assert_eq!(extract_session_id(&headers).as_deref(), Some("sess-c"));
    }

    #[test]
    fn model_action_split() {
        assert_eq!(
            split_model_action("gemini-2.0-flash:generateContent"),
            Some(("gemini-2.0-flash", "generateContent"))
        );
        assert_eq!(split_model_action("no-action"), None);
    }

    #[test]
    fn stream_flag_from_body() {
        assert!(stream_from_body(&Bytes::from_static(
            b"{\"model\":\"m\",\"stream\":true}"
        )));
        assert!(!stream_from_body(&Bytes::from_static(b"{\"model\":\"m\"}")));
        assert!(!stream_from_body(&Bytes::from_static(b"not json")));
    }
}
