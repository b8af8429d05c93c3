use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use lmgate_protocol::{Capability, ProviderFamily};
use lmgate_storage::UpstreamRow;

use crate::affinity::MigrationPolicy;
use crate::quota::SpendingRule;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UpstreamConfigError {
    #[error("upstream {0}: priority must be in 0..=100")]
    PriorityOutOfRange(String),
    #[error("upstream {0}: weight must be in 1..=100")]
    WeightOutOfRange(String),
    #[error("upstream {0}: unknown capability {1}")]
    UnknownCapability(String, String),
    #[error("upstream {0}: route capabilities mix provider families")]
    MixedFamilies(String),
    #[error("upstream {0}: model redirect keys and values must be non-empty")]
    EmptyRedirect(String),
    #[error("upstream {0}: invalid spending rule: {1}")]
    BadRule(String, crate::quota::RuleError),
    #[error("upstream {0}: timeout must be positive")]
    BadTimeout(String),
    #[error("upstream {0}: malformed config json: {1}")]
    Malformed(String, String),
}

/// Fully parsed and validated upstream definition. Everything the router and
/// proxy need at request time lives here; no JSON is touched on the hot path.
#[derive(Debug, Clone)]
pub struct UpstreamSpec {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key_encrypted: String,
    pub priority: i16,
    pub weight: u32,
    pub capabilities: BTreeSet<Capability>,
    pub allowed_models: Option<BTreeSet<String>>,
    pub model_redirects: HashMap<String, String>,
    pub billing_input_multiplier: f64,
    pub billing_output_multiplier: f64,
    pub spending_rules: Vec<SpendingRule>,
    pub affinity_migration: Option<MigrationPolicy>,
    pub timeout: Duration,
    pub active: bool,
}

impl UpstreamSpec {
    pub fn family(&self) -> Option<ProviderFamily> {
        self.capabilities.iter().next().map(Capability::family)
    }

    /// Redirect the requested model for the outbound request, if configured.
    pub fn redirect_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_redirects
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }

    /// Whether this upstream may serve `model` (checked after redirect).
    pub fn allows_model(&self, requested: &str) -> bool {
        match &self.allowed_models {
            Some(allowed) => allowed.contains(self.redirect_model(requested)),
            None => true,
        }
    }
}

pub fn parse_upstream_row(row: &UpstreamRow) -> Result<UpstreamSpec, UpstreamConfigError> {
    let name = row.name.clone();
    let malformed =
        |err: serde_json::Error| UpstreamConfigError::Malformed(name.clone(), err.to_string());

    if !(0..=100).contains(&row.priority) {
        return Err(UpstreamConfigError::PriorityOutOfRange(name));
    }
    if !(1..=100).contains(&row.weight) {
        return Err(UpstreamConfigError::WeightOutOfRange(name));
    }
    if row.timeout_sec <= 0 {
        return Err(UpstreamConfigError::BadTimeout(name));
    }

    let capability_names: Vec<String> =
        serde_json::from_value(row.route_capabilities.clone()).map_err(malformed)?;
    let mut capabilities = BTreeSet::new();
    for raw in capability_names {
        let capability = Capability::parse(&raw)
            .map_err(|_| UpstreamConfigError::UnknownCapability(name.clone(), raw.clone()))?;
        capabilities.insert(capability);
    }
    let families: BTreeSet<ProviderFamily> =
        capabilities.iter().map(Capability::family).collect();
    if families.len() > 1 {
        return Err(UpstreamConfigError::MixedFamilies(name));
    }

    let allowed_models: Option<BTreeSet<String>> = match &row.allowed_models {
        Some(value) => Some(serde_json::from_value(value.clone()).map_err(malformed)?),
        None => None,
    };

    let model_redirects: HashMap<String, String> = match &row.model_redirects {
        Some(value) => serde_json::from_value(value.clone()).map_err(malformed)?,
        None => HashMap::new(),
    };
    if model_redirects
        .iter()
        .any(|(k, v)| k.trim().is_empty() || v.trim().is_empty())
    {
        return Err(UpstreamConfigError::EmptyRedirect(name));
    }

    let spending_rules: Vec<SpendingRule> =
        serde_json::from_value(row.spending_rules.clone()).map_err(malformed)?;
    for rule in &spending_rules {
        rule.validate()
            .map_err(|err| UpstreamConfigError::BadRule(name.clone(), err))?;
    }

    let affinity_migration: Option<MigrationPolicy> = match &row.affinity_migration {
        Some(value) => Some(serde_json::from_value(value.clone()).map_err(malformed)?),
        None => None,
    };

    Ok(UpstreamSpec {
        id: row.id,
        name: row.name.clone(),
        base_url: row.base_url.trim_end_matches('/').to_string(),
        api_key_encrypted: row.api_key_encrypted.clone(),
        priority: row.priority,
        weight: row.weight as u32,
        capabilities,
        allowed_models,
        model_redirects,
        billing_input_multiplier: row.billing_input_multiplier,
        billing_output_multiplier: row.billing_output_multiplier,
        spending_rules,
        affinity_migration,
        timeout: Duration::from_secs(row.timeout_sec as u64),
        active: row.active,
    })
}

/// Copy-on-write table of upstream specs keyed by id.
pub struct UpstreamTable {
    map: ArcSwap<HashMap<i64, Arc<UpstreamSpec>>>,
}

impl Default for UpstreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamTable {
    pub fn new() -> Self {
        Self {
            map: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn replace(&self, specs: Vec<UpstreamSpec>) {
        let map: HashMap<i64, Arc<UpstreamSpec>> = specs
            .into_iter()
            .map(|spec| (spec.id, Arc::new(spec)))
            .collect();
        self.map.store(Arc::new(map));
    }

    pub fn get(&self, id: i64) -> Option<Arc<UpstreamSpec>> {
        self.map.load().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<UpstreamSpec>> {
        self.map.load().values().cloned().collect()
    }

    pub fn rules_by_upstream(&self) -> HashMap<i64, Vec<SpendingRule>> {
        self.map
            .load()
            .values()
            .map(|spec| (spec.id, spec.spending_rules.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> UpstreamRow {
        UpstreamRow {
            id: 1,
            name: "primary-openai".to_string(),
            base_url: "https://api.openai.example/".to_string(),
            api_key_encrypted: "sk-upstream".to_string(),
            priority: 0,
            weight: 3,
            route_capabilities: json!(["openai.chat_completions", "openai.responses"]),
            allowed_models: Some(json!(["gpt-4o", "gpt-4o-mini"])),
            model_redirects: Some(json!({ "gpt-4": "gpt-4o" })),
            billing_input_multiplier: 1.0,
            billing_output_multiplier: 1.0,
            spending_rules: json!([{ "period_type": "daily", "limit": 100.0 }]),
            affinity_migration: None,
            timeout_sec: 120,
            active: true,
        }
    }

    #[test]
    fn parses_a_valid_row() {
        let spec = parse_upstream_row(&row()).unwrap();
        assert_eq!(spec.base_url, "https://api.openai.example");
        assert_eq!(spec.weight, 3);
        assert!(spec.capabilities.contains(&Capability::OpenAiResponses));
        assert_eq!(spec.redirect_model("gpt-4"), "gpt-4o");
        assert!(spec.allows_model("gpt-4"), "redirect applies before the allow-list");
        assert!(!spec.allows_model("o3"));
    }

    #[test]
    fn rejects_mixed_provider_families() {
        let mut bad = row();
        bad.route_capabilities = json!(["openai.chat_completions", "anthropic.messages"]);
        assert!(matches!(
            parse_upstream_row(&bad),
            Err(UpstreamConfigError::MixedFamilies(_))
        ));
    }

    #[test]
    fn rejects_weight_and_priority_out_of_range() {
        let mut bad = row();
        bad.weight = 0;
        assert!(matches!(
            parse_upstream_row(&bad),
            Err(UpstreamConfigError::WeightOutOfRange(_))
        ));

        let mut bad = row();
        bad.priority = 101;
        assert!(matches!(
            parse_upstream_row(&bad),
            Err(UpstreamConfigError::PriorityOutOfRange(_))
        ));
    }

    #[test]
    fn rejects_empty_redirect_entries() {
        let mut bad = row();
        bad.model_redirects = Some(json!({ "gpt-4": "" }));
        assert!(matches!(
            parse_upstream_row(&bad),
            Err(UpstreamConfigError::EmptyRedirect(_))
        ));
    }

    #[test]
    fn rejects_invalid_spending_rules() {
        let mut bad = row();
        bad.spending_rules = json!([{ "period_type": "rolling", "limit": 10.0 }]);
        assert!(matches!(
            parse_upstream_row(&bad),
            Err(UpstreamConfigError::BadRule(_, _))
        ));
    }

    #[test]
    fn no_allow_list_allows_everything() {
        let mut open = row();
        open.allowed_models = None;
        let spec = parse_upstream_row(&open).unwrap();
        assert!(spec.allows_model("anything"));
    }
}
