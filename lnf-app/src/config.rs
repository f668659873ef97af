//! lnfeed configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};

const MAX_STALE_AFTER_SECONDS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct LnFeedConfig {
    pub general: GeneralConfig,
    pub feed: FeedConfig,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Screen name of the only account allowed to originate CONNECT / PAY / FUNDCHANNEL.
    pub owner: String,
    /// Stream filter term. Defaults to our own screen name.
    #[serde(default)]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_api_base")]
    pub api_base: String,
    #[serde(default = "default_feed_stream_base")]
    pub stream_base: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_feed_api_base() -> String {
    "https://api.twitter.com/1.1".to_string()
}

fn default_feed_stream_base() -> String {
    "https://stream.twitter.com/1.1".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Base URL of the node's REST endpoint.
    pub url: String,
    #[serde(default)]
    pub rune: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Channel size for FUNDCHANNEL, in satoshis.
    #[serde(default = "default_fund_channel_sat")]
    pub fund_channel_sat: u64,
}

fn default_fund_channel_sat() -> u64 {
    100_000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NegotiationConfig {
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_stale_after_seconds() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

fn default_max_concurrent_handlers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            stale_after_seconds: default_stale_after_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl LnFeedConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg = Self::from_toml(&contents, |key| std::env::var(key).ok())
            .map_err(|e| anyhow::anyhow!("config {}: {e:#}", path.display()))?;
        Ok((cfg, path))
    }

    /// Parse, apply overrides from `env`, validate.
    fn from_toml(
        contents: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut cfg: LnFeedConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides(env);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("LNFEED_OWNER") {
            self.general.owner = v;
        }
        if let Some(v) = non_empty("LNFEED_FEED_TOKEN") {
            self.feed.bearer_token = v;
        }
        if let Some(v) = non_empty("LNFEED_RPC_URL") {
            self.rpc.url = v;
        }
        if let Some(v) = non_empty("LNFEED_RPC_RUNE") {
            self.rpc.rune = v;
        }
        if let Some(v) = non_empty("LNFEED_DB_PATH") {
            self.store.db_path = Some(v);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.owner.trim().trim_start_matches('@').is_empty() {
            return Err(anyhow::anyhow!("general.owner is required"));
        }
        if self.feed.bearer_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "feed.bearer_token is required (or set LNFEED_FEED_TOKEN)"
            ));
        }
        if self.rpc.url.trim().is_empty() {
            return Err(anyhow::anyhow!("rpc.url is required"));
        }
        if self.feed.timeout_seconds == 0 || self.rpc.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("feed/rpc timeout_seconds must be > 0"));
        }
        if self.rpc.fund_channel_sat == 0 {
            return Err(anyhow::anyhow!("rpc.fund_channel_sat must be > 0"));
        }
        if self.negotiation.stale_after_seconds == 0
            || self.negotiation.stale_after_seconds > MAX_STALE_AFTER_SECONDS
        {
            return Err(anyhow::anyhow!(
                "negotiation.stale_after_seconds must be between 1 and {MAX_STALE_AFTER_SECONDS}"
            ));
        }
        if self.negotiation.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "negotiation.sweep_interval_seconds must be > 0"
            ));
        }
        if self.negotiation.max_concurrent_handlers == 0 {
            return Err(anyhow::anyhow!(
                "negotiation.max_concurrent_handlers must be > 0"
            ));
        }
        Ok(())
    }

    /// Owner screen name without a leading `@`.
    pub fn owner_screen_name(&self) -> &str {
        self.general.owner.trim().trim_start_matches('@')
    }

    pub fn db_path(&self) -> anyhow::Result<PathBuf> {
        match &self.store.db_path {
            Some(path) => expand_home(path),
            None => Ok(default_data_dir().join("lnfeed.sqlite3")),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".lnfeed").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".lnfeed").join("data")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME")
                .map_err(|_| anyhow::anyhow!("HOME is not set; cannot expand {path}"))?;
            Ok(Path::new(&home).join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
