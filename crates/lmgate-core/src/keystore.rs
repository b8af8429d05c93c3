use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use time::OffsetDateTime;

use lmgate_storage::ApiKeyRow;

use crate::crypto::{SecretBox, SecretBoxError};
use crate::error::GatewayError;

/// Hash a presented API key the way rows store it.
pub fn hash_api_key(raw: &str) -> String {
    blake3::hash(raw.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone)]
pub struct ApiKeyEntry {
    pub id: i64,
    pub key_value_encrypted: Option<String>,
    pub key_prefix: String,
    pub name: String,
    pub active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub allowed_upstream_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct KeySnapshot {
    by_hash: HashMap<String, ApiKeyEntry>,
    by_id: HashMap<i64, String>,
}

impl KeySnapshot {
    pub fn from_rows(rows: &[ApiKeyRow]) -> Self {
        let mut by_hash = HashMap::with_capacity(rows.len());
        let mut by_id = HashMap::with_capacity(rows.len());
        for row in rows {
            by_id.insert(row.id, row.key_hash.clone());
            by_hash.insert(
                row.key_hash.clone(),
                ApiKeyEntry {
                    id: row.id,
                    key_value_encrypted: row.key_value_encrypted.clone(),
                    key_prefix: row.key_prefix.clone(),
                    name: row.name.clone(),
                    active: row.active,
                    expires_at: row.expires_at,
                    allowed_upstream_ids: row.allowed_upstream_ids.clone(),
                },
            );
        }
        Self { by_hash, by_id }
    }
}

/// The authenticated identity a request carries through the pipeline.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub api_key_id: i64,
    pub allowed_upstream_ids: Vec<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RevealError {
    #[error("key reveal disabled")]
    Disabled,
    #[error("key not found")]
    NotFound,
    #[error("legacy_key")]
    LegacyKey,
    #[error("secret error: {0}")]
    Secret(#[from] SecretBoxError),
}

/// In-memory API-key authority. Lookups are pure map reads against a
/// copy-on-write snapshot; the raw key is hashed, never compared directly.
pub struct Keystore {
    snapshot: ArcSwap<KeySnapshot>,
    secrets: SecretBox,
    allow_reveal: bool,
}

impl Keystore {
    pub fn new(snapshot: KeySnapshot, secrets: SecretBox, allow_reveal: bool) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            secrets,
            allow_reveal,
        }
    }

    pub fn replace_snapshot(&self, rows: &[ApiKeyRow]) {
        self.snapshot
            .store(Arc::new(KeySnapshot::from_rows(rows)));
    }

    pub fn resolve(&self, presented_key: &str) -> Result<ResolvedKey, GatewayError> {
        let hash = hash_api_key(presented_key.trim());
        let snapshot = self.snapshot.load();
        let entry = snapshot
            .by_hash
            .get(&hash)
            .ok_or_else(|| GatewayError::unauthorized("unknown api key"))?;

        if !entry.active {
            return Err(GatewayError::unauthorized("api key disabled"));
        }
        if let Some(expires_at) = entry.expires_at
            && expires_at <= OffsetDateTime::now_utc()
        {
            return Err(GatewayError::unauthorized("api key expired"));
        }

        Ok(ResolvedKey {
            api_key_id: entry.id,
            allowed_upstream_ids: entry.allowed_upstream_ids.clone(),
        })
    }

    /// Admin-side reveal of a downstream key value, gated by config. Rows
    /// created before encryption was introduced have no stored value.
    pub fn reveal(&self, api_key_id: i64) -> Result<String, RevealError> {
        if !self.allow_reveal {
            return Err(RevealError::Disabled);
        }
        let snapshot = self.snapshot.load();
        let hash = snapshot.by_id.get(&api_key_id).ok_or(RevealError::NotFound)?;
        let entry = snapshot.by_hash.get(hash).ok_or(RevealError::NotFound)?;
        let sealed = entry
            .key_value_encrypted
            .as_deref()
            .ok_or(RevealError::LegacyKey)?;
        Ok(self.secrets.open(sealed)?)
    }

    pub fn secrets(&self) -> &SecretBox {
        &self.secrets
    }
}
