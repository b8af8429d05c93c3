use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value as JsonValue, json};

use lmgate_protocol::Capability;

use crate::affinity::{AffinityStore, should_migrate};
use crate::breaker::{Admission, BreakerRegistry};
use crate::quota::QuotaTracker;
use crate::upstreams::{UpstreamSpec, UpstreamTable};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Everything the router consults besides the request itself.
#[derive(Clone)]
pub struct RouterContext {
    pub table: Arc<UpstreamTable>,
    pub breaker: Arc<BreakerRegistry>,
    pub quota: Arc<QuotaTracker>,
    pub affinity: Arc<AffinityStore>,
}

#[derive(Debug, Clone)]
pub struct RouteQuery {
    pub allowed_upstream_ids: Vec<i64>,
    pub capability: Capability,
    pub requested_model: Option<String>,
    pub session_id: Option<String>,
    pub request_seed: u64,
}

/// One concrete selection the coordinator should try next.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub spec: Arc<UpstreamSpec>,
    pub outbound_model: Option<String>,
    pub tier: i16,
    pub is_probe: bool,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub routing_type: &'static str,
    pub decision: JsonValue,
}

#[derive(Debug, Clone)]
pub enum RouteError {
    /// The key has no upstream for this capability at all: 403.
    NoCandidates,
    /// Candidates exist but every one is masked out (breaker/quota) or the
    /// attempt budget is spent: 503 with the decision trace.
    Exhausted { decision: JsonValue },
}

/// Lazily yields selection attempts for one request. Failed upstreams are
/// excluded and the plan re-picks, descending tiers, until the bounded
/// attempt budget is spent.
pub struct RoutePlan {
    ctx: RouterContext,
    query: RouteQuery,
    candidates: Vec<Arc<UpstreamSpec>>,
    excluded: HashSet<i64>,
    attempts_made: u32,
    max_attempts: u32,
    affinity_checked: bool,
    affinity_migrated: bool,
    trace: Vec<JsonValue>,
}

impl RoutePlan {
    pub fn new(ctx: RouterContext, query: RouteQuery) -> Result<Self, RouteError> {
        let mut candidates: Vec<Arc<UpstreamSpec>> = Vec::new();
        for id in &query.allowed_upstream_ids {
            let Some(spec) = ctx.table.get(*id) else {
                continue;
            };
            if !spec.active {
                continue;
            }
            if !spec.capabilities.contains(&query.capability) {
                continue;
            }
            if let Some(model) = query.requested_model.as_deref()
                && !spec.allows_model(model)
            {
                continue;
            }
            candidates.push(spec);
        }

        if candidates.is_empty() {
            return Err(RouteError::NoCandidates);
        }

        Ok(Self {
            ctx,
            query,
            candidates,
            excluded: HashSet::new(),
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            affinity_checked: false,
            affinity_migrated: false,
            trace: Vec::new(),
        })
    }

    /// Remove a failed upstream from consideration before re-picking.
    pub fn exclude(&mut self, upstream_id: i64) {
        self.excluded.insert(upstream_id);
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn decision_trace(&self) -> JsonValue {
        JsonValue::Array(self.trace.clone())
    }

    pub async fn next_attempt(&mut self) -> Result<Attempt, RouteError> {
        if self.attempts_made >= self.max_attempts {
            return Err(RouteError::Exhausted {
                decision: self.decision_trace(),
            });
        }

        if let Some(attempt) = self.try_affinity().await {
            self.attempts_made += 1;
            return Ok(attempt);
        }

        self.try_weighted().await.map(|attempt| {
            self.attempts_made += 1;
            attempt
        })
    }

    async fn try_affinity(&mut self) -> Option<Attempt> {
        if self.affinity_checked {
            return None;
        }
        self.affinity_checked = true;

        let session_id = self.query.session_id.as_deref()?;
        let binding = self.ctx.affinity.get(session_id).await?;

        let bound = self
            .candidates
            .iter()
            .find(|spec| spec.id == binding.upstream_id && !self.excluded.contains(&spec.id))
            .cloned();

        let Some(spec) = bound else {
            // Bound upstream no longer eligible for this request.
            self.ctx.affinity.drop_binding(session_id).await;
            return None;
        };

        if should_migrate(&binding, spec.affinity_migration.as_ref()) {
            self.ctx.affinity.drop_binding(session_id).await;
            self.affinity_migrated = true;
            self.trace.push(json!({
                "affinity": {
                    "upstream_id": spec.id,
                    "migrated": true,
                    "accumulated_metric": binding.accumulated_metric,
                }
            }));
            return None;
        }

        if !self.ctx.quota.is_within_quota(spec.id).await {
            self.ctx.affinity.drop_binding(session_id).await;
            return None;
        }
        let admission = self.ctx.breaker.admit(spec.id).await;
        if admission == Admission::Rejected {
            self.ctx.affinity.drop_binding(session_id).await;
            return None;
        }

        let decision = json!({
            "attempt": self.attempts_made + 1,
            "routing": "affinity",
            "tier": spec.priority,
            "picked": spec.id,
            "accumulated_metric": binding.accumulated_metric,
        });
        self.trace.push(decision.clone());

        Some(Attempt {
            outbound_model: self
                .query
                .requested_model
                .as_deref()
                .map(|m| spec.redirect_model(m).to_string()),
            tier: spec.priority,
            is_probe: admission == Admission::Probe,
            affinity_hit: true,
            affinity_migrated: false,
            routing_type: "affinity",
            decision,
            spec,
        })
    }

    async fn try_weighted(&mut self) -> Result<Attempt, RouteError> {
        let mut tiers: Vec<i16> = self
            .candidates
            .iter()
            .filter(|spec| !self.excluded.contains(&spec.id))
            .map(|spec| spec.priority)
            .collect();
        tiers.sort_unstable();
        tiers.dedup();

        for tier in tiers {
            let mut mask = Vec::new();
            let mut eligible: Vec<Arc<UpstreamSpec>> = Vec::new();

            for spec in self
                .candidates
                .iter()
                .filter(|spec| spec.priority == tier && !self.excluded.contains(&spec.id))
            {
                let breaker = self.ctx.breaker.preview(spec.id).await;
                if breaker == Admission::Rejected {
                    mask.push(json!({
                        "id": spec.id, "name": spec.name, "weight": spec.weight,
                        "eligible": false, "reason": "breaker_open",
                    }));
                    continue;
                }
                if !self.ctx.quota.is_within_quota(spec.id).await {
                    mask.push(json!({
                        "id": spec.id, "name": spec.name, "weight": spec.weight,
                        "eligible": false, "reason": "quota_exceeded",
                    }));
                    continue;
                }
                mask.push(json!({
                    "id": spec.id, "name": spec.name, "weight": spec.weight,
                    "eligible": true,
                }));
                eligible.push(spec.clone());
            }

            // Weighted pick; a lost probe race excludes the loser and
            // re-picks inside the same tier.
            while !eligible.is_empty() {
                let picked = weighted_pick(&eligible, self.selection_seed());
                let spec = eligible[picked].clone();
                let admission = self.ctx.breaker.admit(spec.id).await;
                if admission == Admission::Rejected {
                    eligible.remove(picked);
                    continue;
                }

                let decision = json!({
                    "attempt": self.attempts_made + 1,
                    "routing": "weighted",
                    "tier": tier,
                    "candidates": mask,
                    "picked": spec.id,
                });
                self.trace.push(decision.clone());

                return Ok(Attempt {
                    outbound_model: self
                        .query
                        .requested_model
                        .as_deref()
                        .map(|m| spec.redirect_model(m).to_string()),
                    tier,
                    is_probe: admission == Admission::Probe,
                    affinity_hit: false,
                    affinity_migrated: self.affinity_migrated,
                    routing_type: "weighted",
                    decision,
                    spec,
                });
            }

            self.trace.push(json!({
                "attempt": self.attempts_made + 1,
                "routing": "weighted",
                "tier": tier,
                "candidates": mask,
                "picked": null,
            }));
        }

        Err(RouteError::Exhausted {
            decision: self.decision_trace(),
        })
    }

    /// Tie-break seed: mixes the per-request seed with the current tick so
    /// concurrent requests do not herd. With a session id the seed is
    /// quantized to a short window so re-picks stay stable.
    fn selection_seed(&self) -> u64 {
        let now_ms = current_tick_ms();
        match self.query.session_id.as_deref() {
            Some(session) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                session.hash(&mut hasher);
                hasher.finish() ^ (now_ms / 10_000).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            }
            None => self
                .query
                .request_seed
                .wrapping_add(self.attempts_made as u64)
                ^ now_ms.wrapping_mul(0x9E37_79B9_7F4A_7C15),
        }
    }
}

fn current_tick_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Probability of index i is weight_i / Σ weight_j.
fn weighted_pick(eligible: &[Arc<UpstreamSpec>], seed: u64) -> usize {
    if eligible.len() == 1 {
        return 0;
    }
    let total: u64 = eligible.iter().map(|s| u64::from(s.weight)).sum();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut roll = rng.random_range(0..total);
    for (idx, spec) in eligible.iter().enumerate() {
        let w = u64::from(spec.weight);
        if roll < w {
            return idx;
        }
        roll -= w;
    }
    eligible.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::time::Duration;

    use crate::affinity::{AffinityMetric, DEFAULT_IDLE_TTL, MigrationPolicy};
    use crate::breaker::{BreakerConfig, BreakerRegistry};
    use crate::quota::{PeriodType, SpendingRule};

    fn spec(id: i64, priority: i16, weight: u32) -> UpstreamSpec {
        UpstreamSpec {
            id,
            name: format!("upstream-{id}"),
            base_url: "https://upstream.example".to_string(),
            api_key_encrypted: "sk-test".to_string(),
            priority,
            weight,
            capabilities: BTreeSet::from([Capability::OpenAiChatCompletions]),
            allowed_models: None,
            model_redirects: HashMap::new(),
            billing_input_multiplier: 1.0,
            billing_output_multiplier: 1.0,
            spending_rules: Vec::new(),
            affinity_migration: None,
            timeout: Duration::from_secs(60),
            active: true,
        }
    }

    fn context(specs: Vec<UpstreamSpec>) -> RouterContext {
        let table = Arc::new(UpstreamTable::new());
        table.replace(specs);
        RouterContext {
            table,
            breaker: Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            quota: Arc::new(QuotaTracker::new()),
            affinity: Arc::new(AffinityStore::new(DEFAULT_IDLE_TTL)),
        }
    }

    fn query(allowed: Vec<i64>) -> RouteQuery {
        RouteQuery {
            allowed_upstream_ids: allowed,
            capability: Capability::OpenAiChatCompletions,
            requested_model: None,
            session_id: None,
            request_seed: 42,
        }
    }

    #[tokio::test]
    async fn no_capability_match_is_a_candidate_error() {
        let ctx = context(vec![spec(1, 0, 1)]);
        let mut q = query(vec![1]);
        q.capability = Capability::AnthropicMessages;
        assert!(matches!(
            RoutePlan::new(ctx, q),
            Err(RouteError::NoCandidates)
        ));
    }

    #[tokio::test]
    async fn key_allow_list_filters_candidates() {
        let ctx = context(vec![spec(1, 0, 1), spec(2, 0, 1)]);
        let mut plan = RoutePlan::new(ctx, query(vec![2])).unwrap();
        let attempt = plan.next_attempt().await.unwrap();
        assert_eq!(attempt.spec.id, 2);
    }

    #[tokio::test]
    async fn lower_priority_number_wins() {
        let ctx = context(vec![spec(1, 10, 1), spec(2, 0, 1)]);
        let mut plan = RoutePlan::new(ctx, query(vec![1, 2])).unwrap();
        let attempt = plan.next_attempt().await.unwrap();
        assert_eq!(attempt.spec.id, 2);
        assert_eq!(attempt.tier, 0);
    }

    #[tokio::test]
    async fn weighted_distribution_converges() {
        // Two upstreams in tier 0 with weights 1 and 3; over 4000 one-shot
        // selections the split should approach 1000/3000 within 3 sigma.
        let mut counts: HashMap<i64, u32> = HashMap::new();
        for round in 0..4000u64 {
            let ctx = context(vec![spec(1, 0, 1), spec(2, 0, 3)]);
            let mut q = query(vec![1, 2]);
            q.request_seed = round.wrapping_mul(0x5851_F42D_4C95_7F2D) ^ 0xDEAD_BEEF;
            let mut plan = RoutePlan::new(ctx, q).unwrap();
            let attempt = plan.next_attempt().await.unwrap();
            *counts.entry(attempt.spec.id).or_default() += 1;
        }
        let light = *counts.get(&1).unwrap_or(&0) as f64;
        let sigma = (4000.0_f64 * 0.25 * 0.75).sqrt();
        assert!(
            (light - 1000.0).abs() <= 3.0 * sigma,
            "weight-1 upstream picked {light} times, expected 1000 ± {:.0}",
            3.0 * sigma
        );
    }

    #[tokio::test]
    async fn open_breaker_masks_upstream_and_failover_descends_tiers() {
        let ctx = context(vec![spec(1, 0, 1), spec(2, 5, 1)]);
        for _ in 0..5 {
            ctx.breaker.record_failure(1).await;
        }
        let mut plan = RoutePlan::new(ctx, query(vec![1, 2])).unwrap();
        let attempt = plan.next_attempt().await.unwrap();
        assert_eq!(attempt.spec.id, 2, "tier 0 fully masked, tier 5 serves");
    }

    #[tokio::test]
    async fn quota_exceeded_masks_upstream() {
        let ctx = context(vec![spec(1, 0, 1), spec(2, 0, 1)]);
        let mut rules = HashMap::new();
        rules.insert(
            1_i64,
            vec![SpendingRule {
                period_type: PeriodType::Daily,
                limit: 1.0,
                period_hours: None,
            }],
        );
        rules.insert(2_i64, Vec::new());
        ctx.quota.configure(&rules).await;
        ctx.quota.record_spending(1, 2.0).await;

        for _ in 0..20 {
            let mut plan =
                RoutePlan::new(ctx.clone(), query(vec![1, 2])).unwrap();
            let attempt = plan.next_attempt().await.unwrap();
            assert_eq!(attempt.spec.id, 2);
        }
    }

    #[tokio::test]
    async fn everything_masked_is_exhausted_with_trace() {
        let ctx = context(vec![spec(1, 0, 1)]);
        for _ in 0..5 {
            ctx.breaker.record_failure(1).await;
        }
        let mut plan = RoutePlan::new(ctx, query(vec![1])).unwrap();
        match plan.next_attempt().await {
            Err(RouteError::Exhausted { decision }) => {
                let trace = decision.as_array().unwrap();
                assert!(!trace.is_empty());
                let reason = trace[0]["candidates"][0]["reason"].as_str().unwrap();
                assert_eq!(reason, "breaker_open");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failover_excludes_failed_upstream() {
        let ctx = context(vec![spec(1, 0, 1), spec(2, 0, 1)]);
        let mut plan = RoutePlan::new(ctx, query(vec![1, 2])).unwrap();
        let first = plan.next_attempt().await.unwrap();
        plan.exclude(first.spec.id);
        let second = plan.next_attempt().await.unwrap();
        assert_ne!(first.spec.id, second.spec.id);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let ctx = context(vec![spec(1, 0, 1), spec(2, 0, 1), spec(3, 0, 1), spec(4, 0, 1)]);
        let mut plan = RoutePlan::new(ctx, query(vec![1, 2, 3, 4])).unwrap();
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            let attempt = plan.next_attempt().await.unwrap();
            plan.exclude(attempt.spec.id);
        }
        assert!(matches!(
            plan.next_attempt().await,
            Err(RouteError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn session_binding_is_reused_until_threshold() {
        let mut bound = spec(1, 0, 1);
        bound.affinity_migration = Some(MigrationPolicy {
            enabled: true,
            metric: AffinityMetric::Tokens,
            threshold: 50_000,
        });
        let ctx = context(vec![bound, spec(2, 0, 100)]);
        ctx.affinity.establish("s1", 1).await;
        ctx.affinity.record_metric("s1", 49_000).await;

        let mut q = query(vec![1, 2]);
        q.session_id = Some("s1".to_string());
        let mut plan = RoutePlan::new(ctx.clone(), q.clone()).unwrap();
        let attempt = plan.next_attempt().await.unwrap();
        assert_eq!(attempt.spec.id, 1);
        assert!(attempt.affinity_hit);

        // Push past the threshold: the binding drops and the request
        // re-routes with affinity_migrated set.
        ctx.affinity.record_metric("s1", 11_000).await;
        let mut plan = RoutePlan::new(ctx.clone(), q).unwrap();
        let attempt = plan.next_attempt().await.unwrap();
        assert!(!attempt.affinity_hit);
        assert!(attempt.affinity_migrated);
        assert!(ctx.affinity.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn binding_to_ineligible_upstream_is_dropped() {
        let ctx = context(vec![spec(1, 0, 1), spec(2, 0, 1)]);
        ctx.affinity.establish("s1", 1).await;
        for _ in 0..5 {
            ctx.breaker.record_failure(1).await;
        }

        let mut q = query(vec![1, 2]);
        q.session_id = Some("s1".to_string());
        let mut plan = RoutePlan::new(ctx.clone(), q).unwrap();
        let attempt = plan.next_attempt().await.unwrap();
        assert_eq!(attempt.spec.id, 2);
        assert!(!attempt.affinity_hit);
        assert!(ctx.affinity.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn model_allow_list_respects_redirects() {
        let mut constrained = spec(1, 0, 1);
        constrained.allowed_models = Some(BTreeSet::from(["gpt-4o".to_string()]));
        constrained.model_redirects =
            HashMap::from([("gpt-4".to_string(), "gpt-4o".to_string())]);
        let ctx = context(vec![constrained]);

        let mut q = query(vec![1]);
        q.requested_model = Some("gpt-4".to_string());
        let mut plan = RoutePlan::new(ctx.clone(), q).unwrap();
        let attempt = plan.next_attempt().await.unwrap();
        assert_eq!(attempt.outbound_model.as_deref(), Some("gpt-4o"));

        let mut q = query(vec![1]);
        q.requested_model = Some("o3".to_string());
        assert!(matches!(
            RoutePlan::new(ctx, q),
            Err(RouteError::NoCandidates)
        ));
    }
}
