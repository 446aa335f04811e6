//! Sync orchestration: configuration, bootstrap, upsert and the reconciliation loop.

use std::time::Duration;

use anyhow::{Context, Result};
use gumsync_remote::{GumroadClient, HttpClientConfig, NotionClient, SecretToken};
use thiserror::Error;
use tracing::info;

mod reconcile;

pub use reconcile::{
    bootstrap, upsert_entry, Bootstrap, CycleSummary, LoopConfig, LoopState, ReconciliationLoop,
    StepOutcome, UpsertAction,
};

pub const CRATE_NAME: &str = "gumsync-sync";

pub const NOTION_TOKEN_VAR: &str = "MY_NOTION_SECRET_TOKEN";
pub const GUMROAD_TOKEN_VAR: &str = "MY_GUMROAD_SECRET_TOKEN";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is required")]
    Missing(&'static str),
    #[error("environment variable {name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub notion_token: SecretToken,
    pub gumroad_token: SecretToken,
    pub database_query: String,
    pub notion_api_base: String,
    pub gumroad_api_base: String,
    pub upsert_delay: Duration,
    pub cycle_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_blank = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| {
            non_blank(name)
                .map(|v| SecretToken::new(v.trim()))
                .ok_or(ConfigError::Missing(name))
        };
        let number = |name: &'static str, default: u64| match non_blank(name) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber { name, value }),
            None => Ok(default),
        };

        Ok(Self {
            notion_token: required(NOTION_TOKEN_VAR)?,
            gumroad_token: required(GUMROAD_TOKEN_VAR)?,
            database_query: non_blank("GUMSYNC_DATABASE_QUERY").unwrap_or_else(|| "Store".to_string()),
            notion_api_base: non_blank("GUMSYNC_NOTION_API_BASE")
                .unwrap_or_else(|| gumsync_remote::notion::NOTION_API_BASE.to_string()),
            gumroad_api_base: non_blank("GUMSYNC_GUMROAD_API_BASE")
                .unwrap_or_else(|| gumsync_remote::gumroad::GUMROAD_API_BASE.to_string()),
            upsert_delay: Duration::from_secs(number("GUMSYNC_UPSERT_DELAY_SECS", 5)?),
            cycle_delay: Duration::from_secs(number("GUMSYNC_CYCLE_DELAY_SECS", 10)?),
            http_timeout_secs: number("GUMSYNC_HTTP_TIMEOUT_SECS", 20)?,
            user_agent: non_blank("GUMSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("gumsync/{}", env!("CARGO_PKG_VERSION"))),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            database_query: self.database_query.clone(),
            upsert_delay: self.upsert_delay,
            cycle_delay: self.cycle_delay,
        }
    }
}

pub type LiveLoop = ReconciliationLoop<NotionClient, GumroadClient>;

/// Build the live clients and bootstrap. Failures here are startup errors.
pub async fn start_from_config(config: &SyncConfig) -> Result<LiveLoop> {
    let http = config.http_client_config();
    let notion = NotionClient::new(&http, &config.notion_api_base, config.notion_token.clone())
        .context("building knowledge-base client")?;
    let gumroad = GumroadClient::new(&http, &config.gumroad_api_base, config.gumroad_token.clone())
        .context("building storefront client")?;

    let sync = ReconciliationLoop::start(notion, gumroad, config.loop_config())
        .await
        .with_context(|| format!("bootstrapping from database matching {:?}", config.database_query))?;
    info!(
        database_id = sync.database_id(),
        rows = sync.index().len(),
        "bootstrapped index"
    );
    Ok(sync)
}

/// Run the reconciliation loop until the process is killed or a fatal error occurs.
pub async fn run_from_env() -> Result<()> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let sync = start_from_config(&config).await?;
    sync.run_forever()
        .await
        .context("reconciliation loop stopped on a fatal error")
}

/// Bootstrap and run exactly one cycle.
pub async fn run_once_from_env() -> Result<CycleSummary> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let mut sync = start_from_config(&config).await?;
    sync.run_cycle().await.context("running reconciliation cycle")
}
