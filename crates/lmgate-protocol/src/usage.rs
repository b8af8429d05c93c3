use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical token counts extracted from a provider response. All fields are
/// non-negative; floats are floored, numeric strings accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
    pub cached: u64,
    pub reasoning: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        *self == TokenUsage::default()
    }
}

/// Extract canonical usage from a provider payload.
///
/// Priority: OpenAI key shape, then Anthropic key shape, then zeros. The
/// payload is the enclosing object (the one carrying a `usage` member), so a
/// full non-stream body and a terminal stream event both work.
pub fn extract_token_usage(payload: Option<&Value>) -> TokenUsage {
    let Some(usage) = payload.and_then(|v| v.get("usage")).filter(|u| !u.is_null()) else {
        return TokenUsage::default();
    };

    if usage.get("prompt_tokens").is_some() || usage.get("completion_tokens").is_some() {
        return from_openai(usage);
    }
    if usage.get("input_tokens").is_some() || usage.get("output_tokens").is_some() {
        return from_anthropic(usage);
    }
    TokenUsage::default()
}

fn from_openai(usage: &Value) -> TokenUsage {
    let prompt = count(usage.get("prompt_tokens"));
    let completion = count(usage.get("completion_tokens"));
    let total = match usage.get("total_tokens") {
        Some(v) if !v.is_null() => count(Some(v)),
        _ => prompt + completion,
    };
    let cached = count(
        usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens")),
    );
    let reasoning = count(
        usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens")),
    );
    TokenUsage {
        prompt,
        completion,
        total,
        cached,
        reasoning,
        cache_creation: 0,
        // OpenAI reports cached prompt tokens once; mirror into cache_read so
        // billing sees a single canonical field.
        cache_read: cached,
    }
}

fn from_anthropic(usage: &Value) -> TokenUsage {
    let prompt = count(usage.get("input_tokens"));
    let completion = count(usage.get("output_tokens"));
    let cache_creation = count(usage.get("cache_creation_input_tokens"));
    let cache_read = count(usage.get("cache_read_input_tokens"));
    TokenUsage {
        prompt,
        completion,
        total: prompt + completion,
        cached: cache_read,
        reasoning: 0,
        cache_creation,
        cache_read,
    }
}

/// JSON number or numeric string to a floored non-negative integer.
fn count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                u
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f > 0.0 { f.floor() as u64 } else { 0 }
            } else {
                0
            }
        }
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) if f.is_finite() && f > 0.0 => f.floor() as u64,
            _ => 0,
        },
        _ => 0,
    }
}

/// Folds usage-bearing stream events into the latest complete picture.
///
/// Anthropic splits usage across `message_start` and `message_delta`; OpenAI
/// sends one final chunk with `usage`. Later non-zero fields win, earlier
/// values survive events that omit them.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    latest: TokenUsage,
    seen: bool,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, payload: &Value) {
        let incoming = extract_token_usage(Some(payload));
        if payload.get("usage").map(|u| u.is_null()).unwrap_or(true) {
            return;
        }
        self.seen = true;
        merge_counts(&mut self.latest, incoming);
        self.latest.total = self.latest.prompt + self.latest.completion;
        if let Some(total) = payload
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .filter(|v| !v.is_null())
        {
            self.latest.total = count(Some(total));
        }
    }

    /// Anthropic nests usage inside `message` on `message_start`.
    pub fn observe_event(&mut self, event_name: Option<&str>, payload: &Value) {
        if event_name == Some("message_start") {
            if let Some(message) = payload.get("message") {
                self.observe(message);
                return;
            }
        }
        self.observe(payload);
    }

    pub fn finalize(&self) -> Option<TokenUsage> {
        self.seen.then_some(self.latest)
    }
}

fn merge_counts(base: &mut TokenUsage, incoming: TokenUsage) {
    if incoming.prompt > 0 {
        base.prompt = incoming.prompt;
    }
    if incoming.completion > 0 {
        base.completion = incoming.completion;
    }
    if incoming.cached > 0 {
        base.cached = incoming.cached;
    }
    if incoming.reasoning > 0 {
        base.reasoning = incoming.reasoning;
    }
    if incoming.cache_creation > 0 {
        base.cache_creation = incoming.cache_creation;
    }
    if incoming.cache_read > 0 {
        base.cache_read = incoming.cache_read;
    }
}
