use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use lmgate_storage::{BreakerPersist, BreakerStateRow};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub probe_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(300),
            probe_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            "half_open" => Some(BreakerState::HalfOpen),
            _ => None,
        }
    }
}

/// Outcome of asking the breaker whether a request may go to an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Half-open trial; exactly one in flight at a time.
    Probe,
    Rejected,
}

#[derive(Debug)]
struct BreakerCell {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    consecutive_rate_limits: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<OffsetDateTime>,
    last_probe_at: Option<Instant>,
    probe_in_flight: bool,
    forced: bool,
}

impl BreakerCell {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_rate_limits: 0,
            opened_at: None,
            last_failure_at: None,
            last_probe_at: None,
            probe_in_flight: false,
            forced: false,
        }
    }

    fn from_row(row: &BreakerStateRow) -> Self {
        let state = BreakerState::parse(&row.state).unwrap_or(BreakerState::Closed);
        Self {
            state,
            failure_count: row.failure_count.max(0) as u32,
            success_count: row.success_count.max(0) as u32,
            consecutive_rate_limits: row.consecutive_rate_limits.max(0) as u32,
            // Persisted open periods restart their clock on boot; a probe at
            // worst arrives open_duration late.
            opened_at: matches!(state, BreakerState::Open).then(Instant::now),
            last_failure_at: None,
            last_probe_at: None,
            probe_in_flight: false,
            forced: row.forced,
        }
    }

    fn transition(&mut self, next: BreakerState, now: Instant) {
        self.state = next;
        self.failure_count = 0;
        self.success_count = 0;
        self.probe_in_flight = false;
        self.opened_at = matches!(next, BreakerState::Open).then_some(now);
    }
}

/// Read-only view for admin and decision traces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerView {
    pub state: &'static str,
    pub failure_count: u32,
    pub success_count: u32,
    pub forced: bool,
}

/// Per-upstream circuit breakers. All transitions are O(1) under the
/// upstream's own lock; nothing does I/O while holding it.
pub struct BreakerRegistry {
    config: BreakerConfig,
    cells: RwLock<HashMap<i64, Arc<Mutex<BreakerCell>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub async fn seed(&self, rows: &[BreakerStateRow]) {
        let mut map = self.cells.write().await;
        for row in rows {
            map.insert(
                row.upstream_id,
                Arc::new(Mutex::new(BreakerCell::from_row(row))),
            );
        }
    }

    async fn cell(&self, upstream_id: i64) -> Arc<Mutex<BreakerCell>> {
        if let Some(cell) = self.cells.read().await.get(&upstream_id) {
            return cell.clone();
        }
        let mut map = self.cells.write().await;
        map.entry(upstream_id)
            .or_insert_with(|| Arc::new(Mutex::new(BreakerCell::new())))
            .clone()
    }

    /// Non-reserving eligibility check used while masking a tier. `Probe`
    /// here only means a probe *could* be admitted right now.
    pub async fn preview(&self, upstream_id: i64) -> Admission {
        let cell = self.cell(upstream_id).await;
        let mut guard = cell.lock().await;
        self.classify(&mut guard, Instant::now(), false)
    }

    /// Reserve admission for the chosen upstream. In half-open this claims
    /// the single probe slot; losers of the race are rejected.
    pub async fn admit(&self, upstream_id: i64) -> Admission {
        let cell = self.cell(upstream_id).await;
        let mut guard = cell.lock().await;
        self.classify(&mut guard, Instant::now(), true)
    }

    fn classify(&self, cell: &mut BreakerCell, now: Instant, reserve: bool) -> Admission {
        if cell.state == BreakerState::Open {
            let elapsed = cell
                .opened_at
                .map(|at| now.duration_since(at))
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.open_duration {
                cell.transition(BreakerState::HalfOpen, now);
            } else {
                return Admission::Rejected;
            }
        }

        match cell.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => {
                if cell.probe_in_flight {
                    return Admission::Rejected;
                }
                if let Some(last) = cell.last_probe_at
                    && now.duration_since(last) < self.config.probe_interval
                {
                    return Admission::Rejected;
                }
                if reserve {
                    cell.probe_in_flight = true;
                    cell.last_probe_at = Some(now);
                }
                Admission::Probe
            }
            BreakerState::Open => Admission::Rejected,
        }
    }

    pub async fn record_success(&self, upstream_id: i64) {
        let cell = self.cell(upstream_id).await;
        let mut guard = cell.lock().await;
        let now = Instant::now();
        guard.consecutive_rate_limits = 0;
        guard.probe_in_flight = false;
        match guard.state {
            BreakerState::Closed => {
                guard.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    guard.transition(BreakerState::Closed, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self, upstream_id: i64) {
        let cell = self.cell(upstream_id).await;
        let mut guard = cell.lock().await;
        self.fail(&mut guard, Instant::now());
    }

    /// 429 is only a breaker failure once it persists past three consecutive
    /// attempts; isolated rate limits stay invisible to the state machine.
    pub async fn record_rate_limited(&self, upstream_id: i64) -> bool {
        let cell = self.cell(upstream_id).await;
        let mut guard = cell.lock().await;
        guard.consecutive_rate_limits += 1;
        if guard.consecutive_rate_limits >= 3 {
            guard.consecutive_rate_limits = 0;
            self.fail(&mut guard, Instant::now());
            return true;
        }
        guard.probe_in_flight = false;
        false
    }

    fn fail(&self, cell: &mut BreakerCell, now: Instant) {
        cell.last_failure_at = Some(OffsetDateTime::now_utc());
        cell.probe_in_flight = false;
        match cell.state {
            BreakerState::Closed => {
                cell.failure_count += 1;
                if cell.failure_count >= self.config.failure_threshold {
                    cell.transition(BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen => {
                cell.transition(BreakerState::Open, now);
            }
            BreakerState::Open => {}
        }
    }

    /// Manual override; sticky until force_close or the usual open-duration
    /// expiry elapses.
    pub async fn force_open(&self, upstream_id: i64) {
        let cell = self.cell(upstream_id).await;
        let mut guard = cell.lock().await;
        guard.transition(BreakerState::Open, Instant::now());
        guard.forced = true;
    }

    pub async fn force_close(&self, upstream_id: i64) {
        let cell = self.cell(upstream_id).await;
        let mut guard = cell.lock().await;
        guard.transition(BreakerState::Closed, Instant::now());
        guard.forced = false;
        guard.consecutive_rate_limits = 0;
    }

    pub async fn view(&self, upstream_id: i64) -> BreakerView {
        let cell = self.cell(upstream_id).await;
        let guard = cell.lock().await;
        BreakerView {
            state: guard.state.as_str(),
            failure_count: guard.failure_count,
            success_count: guard.success_count,
            forced: guard.forced,
        }
    }

    /// Snapshot for persistence after a transition. Monotonic probe/open
    /// instants do not survive restarts; wall-clock fields do.
    pub async fn persist_row(&self, upstream_id: i64) -> BreakerPersist {
        let cell = self.cell(upstream_id).await;
        let guard = cell.lock().await;
        let now_wall = OffsetDateTime::now_utc();
        let opened_at = guard.opened_at.map(|at| {
            now_wall - time::Duration::try_from(at.elapsed()).unwrap_or(time::Duration::ZERO)
        });
        let last_probe_at = guard.last_probe_at.map(|at| {
            now_wall - time::Duration::try_from(at.elapsed()).unwrap_or(time::Duration::ZERO)
        });
        BreakerPersist {
            upstream_id,
            state: guard.state.as_str(),
            failure_count: guard.failure_count as i32,
            success_count: guard.success_count as i32,
            consecutive_rate_limits: guard.consecutive_rate_limits as i32,
            last_failure_at: guard.last_failure_at,
            opened_at,
            last_probe_at,
            forced: guard.forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_exactly_on_fifth_consecutive_failure() {
        let reg = registry();
        for i in 0..4 {
            reg.record_failure(1).await;
            assert_eq!(reg.preview(1).await, Admission::Allowed, "failure {i}");
        }
        reg.record_failure(1).await;
        assert_eq!(reg.preview(1).await, Admission::Rejected);
        assert_eq!(reg.view(1).await.state, "open");
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_streak() {
        let reg = registry();
        for _ in 0..4 {
            reg.record_failure(1).await;
        }
        reg.record_success(1).await;
        reg.record_failure(1).await;
        assert_eq!(reg.preview(1).await, Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_admits_single_probe_after_open_duration() {
        let reg = registry();
        for _ in 0..5 {
            reg.record_failure(1).await;
        }
        assert_eq!(reg.admit(1).await, Admission::Rejected);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(reg.admit(1).await, Admission::Probe);
        // Second caller while the probe is in flight sees the upstream as open.
        assert_eq!(reg.admit(1).await, Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_success_threshold() {
        let reg = registry();
        for _ in 0..5 {
            reg.record_failure(1).await;
        }
        tokio::time::advance(Duration::from_secs(300)).await;

        assert_eq!(reg.admit(1).await, Admission::Probe);
        reg.record_success(1).await;
        assert_eq!(reg.view(1).await.state, "half_open");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(reg.admit(1).await, Admission::Probe);
        reg.record_success(1).await;
        assert_eq!(reg.view(1).await.state, "closed");
        assert_eq!(reg.admit(1).await, Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let reg = registry();
        for _ in 0..5 {
            reg.record_failure(1).await;
        }
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(reg.admit(1).await, Admission::Probe);
        reg.record_failure(1).await;
        assert_eq!(reg.view(1).await.state, "open");
        assert_eq!(reg.admit(1).await, Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_count_only_after_three_consecutive() {
        let reg = registry();
        assert!(!reg.record_rate_limited(1).await);
        assert!(!reg.record_rate_limited(1).await);
        assert!(reg.record_rate_limited(1).await);
        assert_eq!(reg.view(1).await.failure_count, 1);

        // A success in between clears the streak.
        assert!(!reg.record_rate_limited(1).await);
        reg.record_success(1).await;
        assert!(!reg.record_rate_limited(1).await);
        assert!(!reg.record_rate_limited(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn force_open_and_close_override() {
        let reg = registry();
        reg.force_open(1).await;
        assert_eq!(reg.admit(1).await, Admission::Rejected);
        assert!(reg.view(1).await.forced);

        reg.force_close(1).await;
        assert_eq!(reg.admit(1).await, Admission::Allowed);
        assert!(!reg.view(1).await.forced);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_interval_gates_repeat_probes() {
        let reg = registry();
        for _ in 0..5 {
            reg.record_failure(1).await;
        }
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(reg.admit(1).await, Admission::Probe);
        reg.record_failure(1).await;

        // Re-opened; wait out the open duration again, probe, fail, and make
        // sure a second probe inside the probe interval is rejected.
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(reg.admit(1).await, Admission::Probe);
        reg.record_success(1).await;
        assert_eq!(reg.admit(1).await, Admission::Rejected);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(reg.admit(1).await, Admission::Probe);
    }
}
