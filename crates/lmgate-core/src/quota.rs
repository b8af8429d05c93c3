use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use lmgate_storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Daily,
    Monthly,
    Rolling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingRule {
    pub period_type: PeriodType,
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_hours: Option<u32>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("spending limit must be positive")]
    NonPositiveLimit,
    #[error("rolling rule requires period_hours in 1..=8760")]
    BadRollingHours,
    #[error("period_hours only applies to rolling rules")]
    UnexpectedHours,
}

impl SpendingRule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if !(self.limit > 0.0) {
            return Err(RuleError::NonPositiveLimit);
        }
        match (self.period_type, self.period_hours) {
            (PeriodType::Rolling, Some(h)) if (1..=8760).contains(&h) => Ok(()),
            (PeriodType::Rolling, _) => Err(RuleError::BadRollingHours),
            (_, Some(_)) => Err(RuleError::UnexpectedHours),
            (_, None) => Ok(()),
        }
    }
}

pub fn start_of_day_utc(now: OffsetDateTime) -> OffsetDateTime {
    now.date().midnight().assume_utc()
}

pub fn start_of_month_utc(now: OffsetDateTime) -> OffsetDateTime {
    Date::from_calendar_date(now.year(), now.month(), 1)
        .expect("first of month is always valid")
        .midnight()
        .assume_utc()
}

pub fn rolling_window_start(now: OffsetDateTime, hours: u32) -> OffsetDateTime {
    now - time::Duration::hours(i64::from(hours))
}

fn start_of_next_month_utc(now: OffsetDateTime) -> OffsetDateTime {
    let (year, month) = match now.month() {
        Month::December => (now.year() + 1, Month::January),
        other => (now.year(), other.next()),
    };
    Date::from_calendar_date(year, month, 1)
        .expect("first of month is always valid")
        .midnight()
        .assume_utc()
}

/// Window boundaries a rule is currently accumulating under. `resets_at` is
/// None iff the rule is rolling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleWindow {
    pub period_start: OffsetDateTime,
    pub resets_at: Option<OffsetDateTime>,
}

pub fn rule_window(rule: &SpendingRule, now: OffsetDateTime) -> RuleWindow {
    match rule.period_type {
        PeriodType::Daily => RuleWindow {
            period_start: start_of_day_utc(now),
            resets_at: Some(start_of_day_utc(now) + time::Duration::days(1)),
        },
        PeriodType::Monthly => RuleWindow {
            period_start: start_of_month_utc(now),
            resets_at: Some(start_of_next_month_utc(now)),
        },
        PeriodType::Rolling => RuleWindow {
            period_start: rolling_window_start(now, rule.period_hours.unwrap_or(1)),
            resets_at: None,
        },
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    window: RuleWindow,
    spending: f64,
}

#[derive(Debug)]
struct UpstreamQuota {
    rules: Vec<SpendingRule>,
    buckets: Vec<Bucket>,
}

impl UpstreamQuota {
    fn new(rules: Vec<SpendingRule>, now: OffsetDateTime) -> Self {
        let buckets = rules
            .iter()
            .map(|rule| Bucket {
                window: rule_window(rule, now),
                spending: 0.0,
            })
            .collect();
        Self { rules, buckets }
    }

    /// Fixed windows roll forward when they expire; the in-memory counter
    /// restarts at zero and the next DB reseed trues it up. Rolling windows
    /// just slide their start.
    fn roll(&mut self, now: OffsetDateTime) {
        for (rule, bucket) in self.rules.iter().zip(self.buckets.iter_mut()) {
            match bucket.window.resets_at {
                Some(resets_at) if now >= resets_at => {
                    bucket.window = rule_window(rule, now);
                    bucket.spending = 0.0;
                }
                Some(_) => {}
                None => {
                    bucket.window.period_start =
                        rolling_window_start(now, rule.period_hours.unwrap_or(1));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub rule: SpendingRule,
    pub period_start_ms: i64,
    pub resets_at_ms: Option<i64>,
    pub spending: f64,
    pub exceeded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub rules: Vec<RuleStatus>,
    pub is_exceeded: bool,
}

/// In-memory spending aggregator. One logical lock per upstream; no I/O ever
/// happens under a lock. The database is the source of truth and periodic
/// reseeds converge the counters.
pub struct QuotaTracker {
    upstreams: RwLock<HashMap<i64, Arc<Mutex<UpstreamQuota>>>>,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self {
            upstreams: RwLock::new(HashMap::new()),
        }
    }

    /// Install the rule set for the given upstreams and evict everything
    /// else (upstreams whose rules were removed).
    pub async fn configure(&self, rules_by_upstream: &HashMap<i64, Vec<SpendingRule>>) {
        let now = OffsetDateTime::now_utc();
        let mut map = self.upstreams.write().await;
        map.retain(|id, _| rules_by_upstream.contains_key(id));
        for (id, rules) in rules_by_upstream {
            match map.get(id) {
                Some(existing) => {
                    let mut guard = existing.lock().await;
                    if guard.rules != *rules {
                        *guard = UpstreamQuota::new(rules.clone(), now);
                    }
                }
                None => {
                    map.insert(*id, Arc::new(Mutex::new(UpstreamQuota::new(rules.clone(), now))));
                }
            }
        }
    }

    async fn cell(&self, upstream_id: i64) -> Option<Arc<Mutex<UpstreamQuota>>> {
        self.upstreams.read().await.get(&upstream_id).cloned()
    }

    /// Add `cost` to every rule bucket of the upstream. Zero or negative
    /// amounts are ignored.
    pub async fn record_spending(&self, upstream_id: i64, cost: f64) {
        if !(cost > 0.0) {
            return;
        }
        let Some(cell) = self.cell(upstream_id).await else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        let mut quota = cell.lock().await;
        quota.roll(now);
        for bucket in &mut quota.buckets {
            bucket.spending += cost;
        }
    }

    /// AND semantics over rules: within quota iff every bucket is under its
    /// limit. No rules configured means always within quota.
    pub async fn is_within_quota(&self, upstream_id: i64) -> bool {
        let Some(cell) = self.cell(upstream_id).await else {
            return true;
        };
        let now = OffsetDateTime::now_utc();
        let mut quota = cell.lock().await;
        quota.roll(now);
        quota
            .rules
            .iter()
            .zip(quota.buckets.iter())
            .all(|(rule, bucket)| bucket.spending < rule.limit)
    }

    pub async fn status(&self, upstream_id: i64) -> QuotaStatus {
        let Some(cell) = self.cell(upstream_id).await else {
            return QuotaStatus {
                rules: Vec::new(),
                is_exceeded: false,
            };
        };
        let now = OffsetDateTime::now_utc();
        let mut quota = cell.lock().await;
        quota.roll(now);
        let rules: Vec<RuleStatus> = quota
            .rules
            .iter()
            .zip(quota.buckets.iter())
            .map(|(rule, bucket)| RuleStatus {
                rule: rule.clone(),
                period_start_ms: unix_ms(bucket.window.period_start),
                resets_at_ms: bucket.window.resets_at.map(unix_ms),
                spending: bucket.spending,
                exceeded: bucket.spending >= rule.limit,
            })
            .collect();
        let is_exceeded = rules.iter().any(|r| r.exceeded);
        QuotaStatus { rules, is_exceeded }
    }

    /// Reconstruct every bucket from billed snapshots. Reads happen outside
    /// the per-upstream lock; the bucket swap is O(1) under it.
    pub async fn sync_from_storage(&self, storage: &dyn Storage) {
        let cells: Vec<(i64, Arc<Mutex<UpstreamQuota>>)> = {
            let map = self.upstreams.read().await;
            map.iter().map(|(id, cell)| (*id, cell.clone())).collect()
        };

        for (upstream_id, cell) in cells {
            let now = OffsetDateTime::now_utc();
            let rules: Vec<SpendingRule> = cell.lock().await.rules.clone();

            let mut seeded = Vec::with_capacity(rules.len());
            for rule in &rules {
                let window = rule_window(rule, now);
                let spending = match storage
                    .billed_cost_between(upstream_id, window.period_start, now)
                    .await
                {
                    Ok(total) => total,
                    Err(err) => {
                        tracing::warn!(upstream_id, error = %err, "quota reseed query failed");
                        continue;
                    }
                };
                seeded.push(Bucket { window, spending });
            }

            if seeded.len() != rules.len() {
                continue;
            }
            let mut quota = cell.lock().await;
            // Rules may have changed while the queries ran; only swap if the
            // shape still matches.
            if quota.rules == rules {
                quota.buckets = seeded;
            }
        }
    }
}

fn unix_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn spawn_reconciler(
    tracker: Arc<QuotaTracker>,
    storage: Arc<dyn Storage>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(60)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracker.sync_from_storage(storage.as_ref()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily(limit: f64) -> SpendingRule {
        SpendingRule {
            period_type: PeriodType::Daily,
            limit,
            period_hours: None,
        }
    }

    fn rolling(limit: f64, hours: u32) -> SpendingRule {
        SpendingRule {
            period_type: PeriodType::Rolling,
            limit,
            period_hours: Some(hours),
        }
    }

    async fn tracker_with(upstream_id: i64, rules: Vec<SpendingRule>) -> QuotaTracker {
        let tracker = QuotaTracker::new();
        let mut config = HashMap::new();
        config.insert(upstream_id, rules);
        tracker.configure(&config).await;
        tracker
    }

    #[test]
    fn rule_validation() {
        assert!(daily(100.0).validate().is_ok());
        assert_eq!(daily(0.0).validate(), Err(RuleError::NonPositiveLimit));
        assert!(rolling(5.0, 1).validate().is_ok());
        assert!(rolling(5.0, 8760).validate().is_ok());
        assert_eq!(rolling(5.0, 0).validate(), Err(RuleError::BadRollingHours));
        assert_eq!(
            rolling(5.0, 8761).validate(),
            Err(RuleError::BadRollingHours)
        );
        assert_eq!(
            SpendingRule {
                period_type: PeriodType::Rolling,
                limit: 5.0,
                period_hours: None,
            }
            .validate(),
            Err(RuleError::BadRollingHours)
        );
        assert_eq!(
            SpendingRule {
                period_type: PeriodType::Daily,
                limit: 5.0,
                period_hours: Some(3),
            }
            .validate(),
            Err(RuleError::UnexpectedHours)
        );
    }

    #[test]
    fn period_helpers_bound_now() {
        let now = OffsetDateTime::now_utc();

        let day = start_of_day_utc(now);
        assert!(now >= day);
        assert!(now - day < time::Duration::days(1));

        let month = start_of_month_utc(now);
        assert!(now >= month);
        assert!(now - month < time::Duration::days(31));

        let rolling_start = rolling_window_start(now, 5);
        assert_eq!(now - rolling_start, time::Duration::hours(5));
    }

    #[test]
    fn resets_at_is_none_only_for_rolling() {
        let now = OffsetDateTime::now_utc();
        assert!(rule_window(&daily(1.0), now).resets_at.is_some());
        assert!(
            rule_window(
                &SpendingRule {
                    period_type: PeriodType::Monthly,
                    limit: 1.0,
                    period_hours: None
                },
                now
            )
            .resets_at
            .is_some()
        );
        assert!(rule_window(&rolling(1.0, 5), now).resets_at.is_none());
    }

    #[tokio::test]
    async fn and_semantics_across_rules() {
        // Daily limit 100, rolling(5h) limit 30. Spending 35 exceeds the
        // rolling rule even though the daily rule would still allow it.
        let tracker = tracker_with(1, vec![daily(100.0), rolling(30.0, 5)]).await;
        assert!(tracker.is_within_quota(1).await);

        tracker.record_spending(1, 35.0).await;
        assert!(!tracker.is_within_quota(1).await);

        let status = tracker.status(1).await;
        assert!(status.is_exceeded);
        assert!(!status.rules[0].exceeded);
        assert!(status.rules[1].exceeded);
    }

    #[tokio::test]
    async fn spending_is_monotone_and_ignores_non_positive() {
        let tracker = tracker_with(2, vec![daily(10.0)]).await;
        tracker.record_spending(2, 3.0).await;
        tracker.record_spending(2, 0.0).await;
        tracker.record_spending(2, -5.0).await;
        tracker.record_spending(2, 4.0).await;
        let status = tracker.status(2).await;
        assert!((status.rules[0].spending - 7.0).abs() < 1e-9);
        assert!(tracker.is_within_quota(2).await);

        tracker.record_spending(2, 3.0).await;
        assert!(!tracker.is_within_quota(2).await, "at limit counts as exceeded");
    }

    #[tokio::test]
    async fn no_rules_means_always_within() {
        let tracker = tracker_with(3, Vec::new()).await;
        tracker.record_spending(3, 1_000_000.0).await;
        assert!(tracker.is_within_quota(3).await);
    }

    #[tokio::test]
    async fn unknown_upstream_is_within_quota() {
        let tracker = QuotaTracker::new();
        assert!(tracker.is_within_quota(99).await);
    }

    #[tokio::test]
    async fn configure_evicts_removed_upstreams() {
        let tracker = tracker_with(4, vec![daily(1.0)]).await;
        tracker.record_spending(4, 5.0).await;
        assert!(!tracker.is_within_quota(4).await);

        tracker.configure(&HashMap::new()).await;
        assert!(tracker.is_within_quota(4).await, "evicted upstream has no rules");
    }
}
