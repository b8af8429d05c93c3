use std::sync::Arc;

use arc_swap::ArcSwap;

use lmgate_common::GatewayConfig;
use lmgate_storage::StorageSnapshot;

use crate::affinity::{AffinityStore, DEFAULT_IDLE_TTL};
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::crypto::SecretBox;
use crate::headers::{CompensationRule, effective_rules};
use crate::keystore::{KeySnapshot, Keystore};
use crate::pricing::{PriceBook, PriceCatalog};
use crate::quota::QuotaTracker;
use crate::router::RouterContext;
use crate::upstreams::{UpstreamTable, parse_upstream_row};

/// Process-wide runtime state. Every request-path read comes from one of
/// these in-memory structures; reloads swap snapshots, they never lock the
/// hot path.
pub struct AppState {
    pub config: ArcSwap<GatewayConfig>,
    pub keystore: Arc<Keystore>,
    pub upstreams: Arc<UpstreamTable>,
    pub catalog: Arc<PriceCatalog>,
    pub breaker: Arc<BreakerRegistry>,
    pub quota: Arc<QuotaTracker>,
    pub affinity: Arc<AffinityStore>,
    pub compensation_rules: ArcSwap<Vec<CompensationRule>>,
    pub secrets: SecretBox,
}

impl AppState {
    pub async fn from_snapshot(
        config: GatewayConfig,
        snapshot: &StorageSnapshot,
        price_book: PriceBook,
    ) -> anyhow::Result<Arc<Self>> {
        let secrets = SecretBox::new(config.secret_key.as_deref());
        let keystore = Arc::new(Keystore::new(
            KeySnapshot::from_rows(&snapshot.api_keys),
            secrets.clone(),
            config.allow_key_reveal,
        ));

        let upstreams = Arc::new(UpstreamTable::new());
        let breaker = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let quota = Arc::new(QuotaTracker::new());
        let affinity = Arc::new(AffinityStore::new(DEFAULT_IDLE_TTL));

        let state = Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            keystore,
            upstreams,
            catalog: Arc::new(PriceCatalog::new(price_book)),
            breaker: breaker.clone(),
            quota,
            affinity,
            compensation_rules: ArcSwap::from_pointee(Vec::new()),
            secrets,
        });

        state.apply_snapshot(snapshot).await?;
        breaker.seed(&snapshot.breaker_states).await;
        Ok(state)
    }

    /// Rebuild all config-derived snapshots from a fresh storage read. A bad
    /// upstream row aborts the reload; the previous snapshots stay live.
    pub async fn apply_snapshot(&self, snapshot: &StorageSnapshot) -> anyhow::Result<()> {
        let mut specs = Vec::with_capacity(snapshot.upstreams.len());
        for row in &snapshot.upstreams {
            specs.push(parse_upstream_row(row)?);
        }

        self.keystore.replace_snapshot(&snapshot.api_keys);
        self.upstreams.replace(specs);
        self.quota
            .configure(&self.upstreams.rules_by_upstream())
            .await;
        self.compensation_rules
            .store(std::sync::Arc::new(effective_rules(&snapshot.compensation_rules)));
        Ok(())
    }

    pub fn router_context(&self) -> RouterContext {
        RouterContext {
            table: self.upstreams.clone(),
            breaker: self.breaker.clone(),
            quota: self.quota.clone(),
            affinity: self.affinity.clone(),
        }
    }
}
