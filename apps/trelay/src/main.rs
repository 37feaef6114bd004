use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use trelay_common::{
    Account, MemoryAccountStore, RelayConfig, RelayConfigPatch, UpstreamClient,
    UpstreamClientConfig, WreqUpstreamClient,
};
use trelay_core::{AppState, NoopScheduler, NoopUsageRecorder, RelayCore, RelayDeps, ZeroCost};
use trelay_translate::TranslationService;

#[derive(Debug, Clone, Parser)]
#[command(name = "trelay", version, about = "LLM relay proxy with zh/en stream translation")]
struct CliArgs {
    /// Bind host.
    #[arg(long, env = "TRELAY_HOST")]
    host: Option<String>,

    /// Bind port.
    #[arg(long, env = "TRELAY_PORT")]
    port: Option<u16>,

    /// JSON file holding the upstream account pool.
    #[arg(long, env = "TRELAY_ACCOUNTS", default_value = "accounts.json")]
    accounts: String,

    /// Upstream relay request timeout in milliseconds.
    #[arg(long, env = "TRELAY_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Global translation feature flag.
    #[arg(long, env = "TRELAY_TRANSLATION_ENABLED")]
    translation_enabled: Option<bool>,

    /// Account id used for translation calls.
    #[arg(long, env = "TRELAY_TRANSLATION_ACCOUNT_ID")]
    translation_account_id: Option<String>,

    /// Model for translation calls.
    #[arg(long, env = "TRELAY_TRANSLATION_MODEL")]
    translation_model: Option<String>,

    #[arg(long, env = "TRELAY_TRANSLATION_CACHE_SIZE")]
    translation_cache_size: Option<usize>,

    #[arg(long, env = "TRELAY_TRANSLATION_CACHE_TTL_HOURS")]
    translation_cache_ttl_hours: Option<u64>,

    #[arg(long, env = "TRELAY_TRANSLATION_MAX_TOKENS")]
    translation_max_tokens: Option<u32>,
}

impl CliArgs {
    fn into_patch(self) -> RelayConfigPatch {
        RelayConfigPatch {
            host: self.host,
            port: self.port,
            request_timeout_ms: self.request_timeout_ms,
            translation_enabled: self.translation_enabled,
            translation_account_id: self.translation_account_id,
            translation_model: self.translation_model,
            translation_cache_size: self.translation_cache_size,
            translation_cache_ttl_hours: self.translation_cache_ttl_hours,
            translation_max_tokens: self.translation_max_tokens,
        }
    }
}

fn load_accounts(path: &str) -> Vec<Account> {
    match std::fs::read(path) {
        Ok(raw) => match serde_json::from_slice::<Vec<Account>>(&raw) {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(event = "accounts_file_invalid", path = %path, error = %err);
                Vec::new()
            }
        },
        Err(err) => {
            warn!(event = "accounts_file_missing", path = %path, error = %err);
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let accounts_path = args.accounts.clone();
    let config: RelayConfig = args.into_patch().into_config().context("merge config")?;

    let accounts = Arc::new(MemoryAccountStore::new(load_accounts(&accounts_path)));

    let relay_client: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::with_request_timeout(
            Duration::from_millis(config.request_timeout_ms),
        ))
        .context("build relay client")?,
    );
    let translation_client: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::with_request_timeout(
            Duration::from_secs(60),
        ))
        .context("build translation client")?,
    );

    let translation = Arc::new(TranslationService::new(
        config.translation.clone(),
        accounts.clone(),
        translation_client,
    ));

    let relay = RelayCore::new(RelayDeps {
        config: config.clone(),
        accounts: accounts.clone(),
        scheduler: Arc::new(NoopScheduler),
        recorder: Arc::new(NoopUsageRecorder),
        cost: Arc::new(ZeroCost),
        client: relay_client.clone(),
        translation: translation.clone(),
    });

    let state = Arc::new(AppState {
        relay,
        accounts,
        client: relay_client,
    });
    let app = trelay_core::router(state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", bind = %bind, translation_enabled = config.translation.enabled);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let stats = translation.cache_stats();
    info!(
        event = "shutdown",
        cache_size = stats.size,
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        cache_hit_rate = stats.hit_rate,
    );
    Ok(())
}
