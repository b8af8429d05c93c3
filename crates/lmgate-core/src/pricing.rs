use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use lmgate_storage::{PriceBookRows, Storage};

/// Catalog refresh floor; the DB is never polled faster than this.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriceSource {
    Manual,
    LiteLlm,
    OpenRouter,
}

impl PriceSource {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "litellm" => Some(PriceSource::LiteLlm),
            "openrouter" => Some(PriceSource::OpenRouter),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriceSource::Manual => "manual",
            PriceSource::LiteLlm => "litellm",
            PriceSource::OpenRouter => "openrouter",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceEntry {
    pub model: String,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
    pub source: PriceSource,
}

/// Immutable lookup built from one DB read. Manual overrides always beat
/// synced rows; among synced rows litellm beats openrouter, and `synced_at`
/// only orders rows within the same source.
#[derive(Debug, Default)]
pub struct PriceBook {
    overrides: HashMap<String, PriceEntry>,
    synced: HashMap<String, PriceEntry>,
}

impl PriceBook {
    pub fn from_rows(rows: &PriceBookRows) -> Self {
        let mut overrides = HashMap::with_capacity(rows.overrides.len());
        for row in &rows.overrides {
            overrides.insert(
                row.model.clone(),
                PriceEntry {
                    model: row.model.clone(),
                    input_price_per_million: row.input_price_per_million,
                    output_price_per_million: row.output_price_per_million,
                    cache_read_price_per_million: row.cache_read_price_per_million,
                    cache_write_price_per_million: row.cache_write_price_per_million,
                    source: PriceSource::Manual,
                },
            );
        }

        struct Best {
            source: PriceSource,
            synced_at: time::OffsetDateTime,
            entry: PriceEntry,
        }
        let mut best: HashMap<String, Best> = HashMap::new();
        for row in &rows.synced {
            if !row.is_active {
                continue;
            }
            let Some(source) = PriceSource::parse(&row.source) else {
                continue;
            };
            let entry = PriceEntry {
                model: row.model.clone(),
                input_price_per_million: row.input_price_per_million,
                output_price_per_million: row.output_price_per_million,
                cache_read_price_per_million: row.cache_read_price_per_million,
                cache_write_price_per_million: row.cache_write_price_per_million,
                source,
            };
            match best.get(&row.model) {
                Some(current)
                    if (current.source, std::cmp::Reverse(current.synced_at))
                        <= (source, std::cmp::Reverse(row.synced_at)) => {}
                _ => {
                    best.insert(
                        row.model.clone(),
                        Best {
                            source,
                            synced_at: row.synced_at,
                            entry,
                        },
                    );
                }
            }
        }

        let synced = best
            .into_iter()
            .map(|(model, b)| (model, b.entry))
            .collect();
        Self { overrides, synced }
    }

    pub fn price_of(&self, model: &str) -> Option<&PriceEntry> {
        self.overrides.get(model).or_else(|| self.synced.get(model))
    }
}

/// Copy-on-write price catalog. Readers grab a consistent book without
/// locking; the refresher swaps the whole book.
pub struct PriceCatalog {
    book: ArcSwap<PriceBook>,
}

impl PriceCatalog {
    pub fn new(book: PriceBook) -> Self {
        Self {
            book: ArcSwap::from_pointee(book),
        }
    }

    pub fn price_of(&self, model: &str) -> Option<PriceEntry> {
        self.book.load().price_of(model).cloned()
    }

    pub fn replace(&self, book: PriceBook) {
        self.book.store(Arc::new(book));
    }
}

pub fn spawn_refresher(
    catalog: Arc<PriceCatalog>,
    storage: Arc<dyn Storage>,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = interval.max(MIN_REFRESH_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; the catalog already holds the
        // bootstrap book.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage.load_price_book().await {
                Ok(rows) => catalog.replace(PriceBook::from_rows(&rows)),
                Err(err) => tracing::warn!(error = %err, "price catalog refresh failed"),
            }
        }
    })
}
