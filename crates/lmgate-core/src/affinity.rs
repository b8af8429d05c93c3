use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffinityMetric {
    /// Total token count of each response.
    Tokens,
    /// Response body length in bytes.
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MigrationPolicy {
    pub enabled: bool,
    pub metric: AffinityMetric,
    pub threshold: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BindingView {
    pub upstream_id: i64,
    pub accumulated_metric: u64,
}

#[derive(Debug)]
struct Binding {
    upstream_id: i64,
    accumulated_metric: u64,
    last_used_at: Instant,
}

/// Sticky session routing: one upstream per logical conversation, with
/// bounded migration once the accumulated metric crosses the upstream's
/// threshold. Bindings expire after an idle TTL.
pub struct AffinityStore {
    bindings: RwLock<HashMap<String, Binding>>,
    ttl: Duration,
}

impl AffinityStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<BindingView> {
        let now = Instant::now();
        {
            let bindings = self.bindings.read().await;
            match bindings.get(session_id) {
                Some(b) if now.duration_since(b.last_used_at) < self.ttl => {
                    return Some(BindingView {
                        upstream_id: b.upstream_id,
                        accumulated_metric: b.accumulated_metric,
                    });
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired; evict lazily.
        self.bindings.write().await.remove(session_id);
        None
    }

    /// Write (or rebind) the session. A fresh binding starts its metric at
    /// zero, so a migrated session measures only its new upstream.
    pub async fn establish(&self, session_id: &str, upstream_id: i64) {
        let mut bindings = self.bindings.write().await;
        match bindings.get_mut(session_id) {
            Some(b) if b.upstream_id == upstream_id => {
                b.last_used_at = Instant::now();
            }
            _ => {
                bindings.insert(
                    session_id.to_string(),
                    Binding {
                        upstream_id,
                        accumulated_metric: 0,
                        last_used_at: Instant::now(),
                    },
                );
            }
        }
    }

    pub async fn record_metric(&self, session_id: &str, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut bindings = self.bindings.write().await;
        if let Some(b) = bindings.get_mut(session_id) {
            b.accumulated_metric = b.accumulated_metric.saturating_add(amount);
            b.last_used_at = Instant::now();
        }
    }

    pub async fn drop_binding(&self, session_id: &str) {
        self.bindings.write().await.remove(session_id);
    }

    pub async fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.bindings
            .write()
            .await
            .retain(|_, b| now.duration_since(b.last_used_at) < ttl);
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}

pub fn should_migrate(binding: &BindingView, policy: Option<&MigrationPolicy>) -> bool {
    match policy {
        Some(p) if p.enabled => binding.accumulated_metric >= p.threshold,
        _ => false,
    }
}

pub fn spawn_sweeper(store: Arc<AffinityStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.sweep().await;
        }
    })
}
