use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid database url: must start with postgresql:// or postgres://")]
    InvalidDatabaseUrl,
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > defaults, finalized once at bootstrap. The
/// running process never re-reads the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a blake3 hash, never plaintext.
    pub admin_token_hash: String,
    pub database_url: String,
    /// Key material for at-rest secret encryption. Empty disables decryption
    /// of encrypted rows (they fail closed).
    pub secret_key: Option<String>,
    pub allow_key_reveal: bool,
    pub debug_log_headers: bool,
    pub log_retention_days: u32,
    pub cors_origins: Vec<String>,
    /// Quota reconciler and price catalog refresh period, seconds. Floored
    /// at 60 during finalize.
    pub reconcile_interval_secs: u64,
}

/// Optional layer used while merging configuration sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_token_hash: Option<String>,
    pub database_url: Option<String>,
    pub secret_key: Option<String>,
    pub allow_key_reveal: Option<bool>,
    pub debug_log_headers: Option<bool>,
    pub log_retention_days: Option<u32>,
    pub cors_origins: Option<Vec<String>>,
    pub reconcile_interval_secs: Option<u64>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_token_hash.is_some() {
            self.admin_token_hash = other.admin_token_hash;
        }
        if other.database_url.is_some() {
            self.database_url = other.database_url;
        }
        if other.secret_key.is_some() {
            self.secret_key = other.secret_key;
        }
        if other.allow_key_reveal.is_some() {
            self.allow_key_reveal = other.allow_key_reveal;
        }
        if other.debug_log_headers.is_some() {
            self.debug_log_headers = other.debug_log_headers;
        }
        if other.log_retention_days.is_some() {
            self.log_retention_days = other.log_retention_days;
        }
        if other.cors_origins.is_some() {
            self.cors_origins = other.cors_origins;
        }
        if other.reconcile_interval_secs.is_some() {
            self.reconcile_interval_secs = other.reconcile_interval_secs;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        let database_url = self
            .database_url
            .ok_or(GatewayConfigError::MissingField("database_url"))?;
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(GatewayConfigError::InvalidDatabaseUrl);
        }
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            admin_token_hash: self
                .admin_token_hash
                .ok_or(GatewayConfigError::MissingField("admin_token_hash"))?,
            database_url,
            secret_key: self.secret_key,
            allow_key_reveal: self.allow_key_reveal.unwrap_or(false),
            debug_log_headers: self.debug_log_headers.unwrap_or(false),
            log_retention_days: self.log_retention_days.unwrap_or(90),
            cors_origins: self
                .cors_origins
                .unwrap_or_else(|| vec!["http://localhost:3000".to_string()]),
            reconcile_interval_secs: self.reconcile_interval_secs.unwrap_or(60).max(60),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_token_hash: Some(value.admin_token_hash),
            database_url: Some(value.database_url),
            secret_key: value.secret_key,
            allow_key_reveal: Some(value.allow_key_reveal),
            debug_log_headers: Some(value.debug_log_headers),
            log_retention_days: Some(value.log_retention_days),
            cors_origins: Some(value.cors_origins),
            reconcile_interval_secs: Some(value.reconcile_interval_secs),
        }
    }
}

pub fn parse_cors_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_patch() -> GatewayConfigPatch {
        GatewayConfigPatch {
            admin_token_hash: Some("deadbeef".to_string()),
            database_url: Some("postgres://lmgate@localhost/lmgate".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply_on_finalize() {
        let config = minimal_patch().into_config().unwrap();
        assert_eq!(config.port, 8080);
        assert!(!config.allow_key_reveal);
        assert_eq!(config.log_retention_days, 90);
        assert_eq!(config.cors_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.reconcile_interval_secs, 60);
    }

    #[test]
    fn rejects_non_postgres_dsn() {
        let mut patch = minimal_patch();
        patch.database_url = Some("mysql://root@localhost/lmgate".to_string());
        assert!(matches!(
            patch.into_config(),
            Err(GatewayConfigError::InvalidDatabaseUrl)
        ));
    }

    #[test]
    fn reconcile_interval_is_floored() {
        let mut patch = minimal_patch();
        patch.reconcile_interval_secs = Some(5);
        assert_eq!(patch.into_config().unwrap().reconcile_interval_secs, 60);
    }

    #[test]
    fn overlay_prefers_incoming_values() {
        let mut base = minimal_patch();
        base.overlay(GatewayConfigPatch {
            port: Some(9090),
            ..Default::default()
        });
        assert_eq!(base.into_config().unwrap().port, 9090);
    }

    #[test]
    fn cors_origins_split_and_trim() {
        let origins = parse_cors_origins("http://a.example, http://b.example ,");
        assert_eq!(origins, vec!["http://a.example", "http://b.example"]);
    }
}
