use serde::{Deserialize, Serialize};

use lmgate_common::Headers;
use lmgate_protocol::{AuthScheme, Capability};
use lmgate_storage::CompensationRuleRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Drop,
    Replace,
    CompensateIfMissing,
}

impl RuleAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "drop" => Some(RuleAction::Drop),
            "replace" => Some(RuleAction::Replace),
            "compensate_if_missing" => Some(RuleAction::CompensateIfMissing),
            _ => None,
        }
    }
}

/// Where a replaced or compensated header takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueSource {
    Static { value: String },
    Header { name: String },
    Cookie { name: String },
    RequestId,
}

impl ValueSource {
    fn resolve(&self, inbound: &Headers, request_id: &str) -> Option<String> {
        match self {
            ValueSource::Static { value } => Some(value.clone()),
            ValueSource::Header { name } => {
                lmgate_common::header_get(inbound, name).map(str::to_string)
            }
            ValueSource::Cookie { name } => {
                let cookies = lmgate_common::header_get(inbound, "cookie")?;
                cookie_value(cookies, name)
            }
            ValueSource::RequestId => Some(request_id.to_string()),
        }
    }

    fn describe(&self) -> String {
        match self {
            ValueSource::Static { .. } => "static".to_string(),
            ValueSource::Header { name } => format!("header:{name}"),
            ValueSource::Cookie { name } => format!("cookie:{name}"),
            ValueSource::RequestId => "request_id".to_string(),
        }
    }
}

fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == name).then(|| v.trim().to_string())
    })
}

#[derive(Debug, Clone)]
pub struct CompensationRule {
    pub capability: Option<Capability>,
    pub header: String,
    pub action: RuleAction,
    pub source: Option<ValueSource>,
    pub enabled: bool,
    pub built_in: bool,
    pub order: i32,
}

impl CompensationRule {
    fn matches(&self, capability: &Capability, header: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.header.eq_ignore_ascii_case(header) {
            return false;
        }
        match &self.capability {
            Some(cap) => cap == capability,
            None => true,
        }
    }

    pub fn from_row(row: &CompensationRuleRow) -> Option<Self> {
        let capability = match &row.capability {
            Some(raw) => Some(Capability::parse(raw).ok()?),
            None => None,
        };
        let source = match &row.source {
            Some(value) => Some(serde_json::from_value(value.clone()).ok()?),
            None => None,
        };
        Some(Self {
            capability,
            header: row.header_name.to_ascii_lowercase(),
            action: RuleAction::parse(&row.action)?,
            source,
            enabled: row.enabled,
            built_in: row.built_in,
            order: row.rule_order,
        })
    }
}

/// Rules every deployment carries: inbound auth material never reaches an
/// upstream. They can be disabled per row but not deleted.
pub fn builtin_rules() -> Vec<CompensationRule> {
    ["authorization", "x-api-key", "x-goog-api-key"]
        .into_iter()
        .enumerate()
        .map(|(idx, header)| CompensationRule {
            capability: None,
            header: header.to_string(),
            action: RuleAction::Drop,
            source: None,
            enabled: true,
            built_in: true,
            order: idx as i32,
        })
        .collect()
}

/// Merge stored rules over the built-ins: a stored row for a built-in header
/// can disable it, everything else appends in rule order.
pub fn effective_rules(rows: &[CompensationRuleRow]) -> Vec<CompensationRule> {
    let mut rules = builtin_rules();
    let mut extra: Vec<CompensationRule> =
        rows.iter().filter_map(CompensationRule::from_row).collect();
    extra.sort_by_key(|r| r.order);
    for rule in extra {
        if let Some(existing) = rules
            .iter_mut()
            .find(|b| b.built_in && b.header == rule.header && rule.built_in)
        {
            existing.enabled = rule.enabled;
        } else {
            rules.push(rule);
        }
    }
    rules
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReplaced {
    pub header: String,
    pub inbound: Option<String>,
    pub outbound: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensatedHeader {
    pub name: String,
    pub source: String,
}

/// The persisted view of what the gateway did to the headers. Values are
/// sanitized before they get here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderDiff {
    pub dropped: Vec<DroppedHeader>,
    pub auth_replaced: Option<AuthReplaced>,
    pub compensated: Vec<CompensatedHeader>,
    pub unchanged: Vec<DroppedHeader>,
}

pub struct CompensatedRequest {
    pub outbound: Headers,
    /// Credential attached as a query parameter instead of a header
    /// (Google-style `?key=`).
    pub query_credential: Option<(String, String)>,
    pub diff: HeaderDiff,
}

/// Build the outbound header set for one request.
///
/// Partition invariant: every outbound header lands in exactly one of
/// `unchanged`, `compensated`, or `auth_replaced`; `dropped` records inbound
/// headers that never went out.
pub fn compensate(
    capability: &Capability,
    inbound: &Headers,
    rules: &[CompensationRule],
    upstream_credential: &str,
    request_id: &str,
) -> CompensatedRequest {
    let mut outbound: Headers = Vec::new();
    let mut diff = HeaderDiff::default();
    let scheme = capability.auth_scheme();
    let auth_header = match scheme {
        AuthScheme::Bearer => Some("authorization"),
        AuthScheme::XApiKey => Some("x-api-key"),
        AuthScheme::QueryKey => None,
    };

    let mut inbound_auth: Option<String> = None;

    for (name, value) in inbound {
        let lower = name.to_ascii_lowercase();
        if is_hop_by_hop(&lower) {
            continue;
        }
        if Some(lower.as_str()) == auth_header {
            inbound_auth = Some(mask_header_value(&lower, value));
            continue;
        }

        match rules.iter().find(|rule| rule.matches(capability, &lower)) {
            Some(rule) => match rule.action {
                RuleAction::Drop => diff.dropped.push(DroppedHeader {
                    name: lower,
                    value: mask_header_value(name, value),
                }),
                RuleAction::Replace => {
                    let resolved = rule
                        .source
                        .as_ref()
                        .and_then(|s| s.resolve(inbound, request_id));
                    match resolved {
                        Some(new_value) => {
                            outbound.push((name.clone(), new_value));
                            diff.compensated.push(CompensatedHeader {
                                name: lower,
                                source: rule
                                    .source
                                    .as_ref()
                                    .map(ValueSource::describe)
                                    .unwrap_or_default(),
                            });
                        }
                        None => diff.dropped.push(DroppedHeader {
                            name: lower,
                            value: mask_header_value(name, value),
                        }),
                    }
                }
                // Header is present, so there is nothing to compensate;
                // forward as-is.
                RuleAction::CompensateIfMissing => {
                    outbound.push((name.clone(), value.clone()));
                    diff.unchanged.push(DroppedHeader {
                        name: lower,
                        value: mask_header_value(name, value),
                    });
                }
            },
            None => {
                outbound.push((name.clone(), value.clone()));
                diff.unchanged.push(DroppedHeader {
                    name: lower,
                    value: mask_header_value(name, value),
                });
            }
        }
    }

    // Fill configured headers that the client did not send.
    for rule in rules {
        if rule.action != RuleAction::CompensateIfMissing {
            continue;
        }
        if !rule.enabled {
            continue;
        }
        if let Some(cap) = &rule.capability
            && cap != capability
        {
            continue;
        }
        if lmgate_common::header_get(&outbound, &rule.header).is_some() {
            continue;
        }
        let Some(value) = rule
            .source
            .as_ref()
            .and_then(|s| s.resolve(inbound, request_id))
        else {
            continue;
        };
        outbound.push((rule.header.clone(), value));
        diff.compensated.push(CompensatedHeader {
            name: rule.header.clone(),
            source: rule
                .source
                .as_ref()
                .map(ValueSource::describe)
                .unwrap_or_default(),
        });
    }

    // Attach the upstream credential last so nothing can override it.
    let query_credential = match scheme {
        AuthScheme::Bearer => {
            let value = format!("Bearer {upstream_credential}");
            diff.auth_replaced = Some(AuthReplaced {
                header: "authorization".to_string(),
                inbound: inbound_auth,
                outbound: mask_header_value("authorization", &value),
            });
            outbound.push(("authorization".to_string(), value));
            None
        }
        AuthScheme::XApiKey => {
            diff.auth_replaced = Some(AuthReplaced {
                header: "x-api-key".to_string(),
                inbound: inbound_auth,
                outbound: mask_header_value("x-api-key", upstream_credential),
            });
            outbound.push(("x-api-key".to_string(), upstream_credential.to_string()));
            None
        }
        AuthScheme::QueryKey => {
            diff.auth_replaced = Some(AuthReplaced {
                header: "key".to_string(),
                inbound: inbound_auth,
                outbound: mask_header_value("x-key", upstream_credential),
            });
            Some(("key".to_string(), upstream_credential.to_string()))
        }
    };

    CompensatedRequest {
        outbound,
        query_credential,
        diff,
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "host"
            | "content-length"
            | "transfer-encoding"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "upgrade"
            | "accept-encoding"
    )
}

const SENSITIVE_NAME_PARTS: [&str; 5] = ["authorization", "api-key", "x-key", "secret", "token"];

fn is_sensitive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if lower == "cookie" || lower == "set-cookie" {
        return true;
    }
    SENSITIVE_NAME_PARTS.iter().any(|part| lower.contains(part))
}

/// Sanitize a header value for persistence. Cookies are fully masked;
/// sensitive values keep a short prefix and suffix bracketing `***`;
/// already-masked values pass through.
pub fn mask_header_value(name: &str, value: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower == "cookie" || lower == "set-cookie" {
        return "***".to_string();
    }
    if !is_sensitive_name(&lower) {
        return value.to_string();
    }
    if value.contains("***") {
        return value.to_string();
    }

    if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
        return format!("Bearer {}", mask_token(token));
    }
    mask_token(value)
}

fn mask_token(token: &str) -> String {
    let token = token.trim();
    if token.len() > 12 {
        format!("{}***{}", &token[..5], &token[token.len() - 4..])
    } else {
        "***".to_string()
    }
}
