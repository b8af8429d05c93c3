use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use lmgate_common::{GatewayConfig, GatewayConfigPatch, parse_cors_origins};
use lmgate_storage::{SeaOrmStorage, Storage};

use crate::affinity::spawn_sweeper;
use crate::pricing::{PriceBook, spawn_refresher};
use crate::quota::spawn_reconciler;
use crate::state::AppState;

#[derive(Debug, Clone, Parser)]
#[command(name = "lmgate", version, about = "AI API gateway")]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "PORT")]
    pub port: Option<String>,

    /// Admin token (plaintext). Stored as a hash in memory.
    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Postgres DSN; must start with postgresql:// or postgres://.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Key material for at-rest secret encryption.
    #[arg(long, env = "LMGATE_SECRET_KEY")]
    pub secret_key: Option<String>,

    #[arg(long, env = "ALLOW_KEY_REVEAL")]
    pub allow_key_reveal: Option<String>,

    #[arg(long, env = "DEBUG_LOG_HEADERS")]
    pub debug_log_headers: Option<String>,

    #[arg(long, env = "LOG_RETENTION_DAYS")]
    pub log_retention_days: Option<String>,

    /// Comma-separated allowed CORS origins for the admin surface.
    #[arg(long, env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,
}

pub struct Bootstrap {
    pub storage: Arc<SeaOrmStorage>,
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let admin_token = sanitize_optional_env_value(args.admin_token)
        .context("ADMIN_TOKEN is required")?;

    let patch = GatewayConfigPatch {
        host: sanitize_optional_env_value(args.host),
        port: parse_u16_env_value(args.port, "PORT")?,
        admin_token_hash: Some(hash_admin_token(&admin_token)),
        database_url: sanitize_optional_env_value(args.database_url),
        secret_key: sanitize_optional_env_value(args.secret_key),
        allow_key_reveal: parse_bool_env_value(args.allow_key_reveal, "ALLOW_KEY_REVEAL")?,
        debug_log_headers: parse_bool_env_value(args.debug_log_headers, "DEBUG_LOG_HEADERS")?,
        log_retention_days: parse_u32_env_value(args.log_retention_days, "LOG_RETENTION_DAYS")?,
        cors_origins: sanitize_optional_env_value(args.cors_origins)
            .map(|raw| parse_cors_origins(&raw)),
        reconcile_interval_secs: None,
    };
    let config: GatewayConfig = patch.into_config().context("finalize gateway config")?;

    let storage = Arc::new(
        SeaOrmStorage::connect(&config.database_url)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    let snapshot = storage.load_snapshot().await.context("load snapshot")?;
    let price_rows = storage.load_price_book().await.context("load price book")?;

    let state = AppState::from_snapshot(config.clone(), &snapshot, PriceBook::from_rows(&price_rows))
        .await
        .context("build app state")?;

    // Quota buckets start from what billing already recorded.
    state.quota.sync_from_storage(storage.as_ref()).await;

    spawn_background_tasks(&state, storage.clone(), &config);

    Ok(Bootstrap { storage, state })
}

fn spawn_background_tasks(
    state: &Arc<AppState>,
    storage: Arc<SeaOrmStorage>,
    config: &GatewayConfig,
) {
    let interval = Duration::from_secs(config.reconcile_interval_secs);
    let storage_dyn: Arc<dyn Storage> = storage.clone();

    spawn_reconciler(state.quota.clone(), storage_dyn.clone(), interval);
    spawn_refresher(state.catalog.clone(), storage_dyn.clone(), interval);
    spawn_sweeper(state.affinity.clone(), Duration::from_secs(60));

    // Config reload: keystore, upstream table and compensation rules follow
    // the same copy-on-write swap as the price catalog.
    let state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage_dyn.load_snapshot().await {
                Ok(snapshot) => {
                    if let Err(err) = state.apply_snapshot(&snapshot).await {
                        tracing::warn!(error = %err, "snapshot reload rejected");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "snapshot reload failed"),
            }
        }
    });
}

pub fn hash_admin_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Unresolved PaaS placeholders like `${VAR}` count as "not set".
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_u32_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u32>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u32>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}
