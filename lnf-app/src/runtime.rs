//! Process entry points: build the context from configuration and run.

use crate::config::LnFeedConfig;
use crate::context::{AppContext, Identities};
use crate::store::Store;
use crate::watch::{WatchLoop, WatchSettings};
use anyhow::{Context, Result};
use lnf_feed::{FeedClient, HttpFeedAdapter};
use lnf_rpc::{ClnRestClient, NodeRpc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STATUS_LIST_LIMIT: usize = 50;

fn build_feed(cfg: &LnFeedConfig) -> Result<Arc<dyn FeedClient>> {
    let feed: Arc<dyn FeedClient> = Arc::new(HttpFeedAdapter::new(
        &cfg.feed.api_base,
        &cfg.feed.stream_base,
        &cfg.feed.bearer_token,
        Duration::from_secs(cfg.feed.timeout_seconds),
    )?);
    Ok(feed)
}

fn build_rpc(cfg: &LnFeedConfig) -> Result<Arc<dyn NodeRpc>> {
    let rpc: Arc<dyn NodeRpc> = Arc::new(ClnRestClient::new(
        &cfg.rpc.url,
        &cfg.rpc.rune,
        Duration::from_secs(cfg.rpc.timeout_seconds),
        cfg.rpc.fund_channel_sat,
    )?);
    Ok(rpc)
}

async fn resolve_identities(cfg: &LnFeedConfig, feed: &dyn FeedClient) -> Result<Identities> {
    let me = feed.whoami().await.context("resolve own feed identity")?;
    let owner = feed
        .lookup_user(cfg.owner_screen_name())
        .await
        .with_context(|| format!("resolve owner @{}", cfg.owner_screen_name()))?;
    if owner.id == me.id {
        tracing::warn!(account = %me.screen_name, "owner and bot share one account; own posts are never treated as commands");
    }
    Ok(Identities { me, owner })
}

pub async fn watch(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = LnFeedConfig::load_with_path(config_path).await?;
    let feed = build_feed(&cfg)?;
    let rpc = build_rpc(&cfg)?;
    let identities = resolve_identities(&cfg, feed.as_ref()).await?;
    let db_path = cfg.db_path()?;
    let store = Arc::new(
        Store::open(&db_path)
            .await
            .with_context(|| format!("open store {}", db_path.display()))?,
    );

    let track = cfg
        .general
        .track
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| identities.me.screen_name.clone());
    tracing::info!(
        config_path = %cfg_path.display(),
        db_path = %db_path.display(),
        me = %identities.me.screen_name,
        owner = %identities.owner.screen_name,
        track = %track,
        rpc_url = %cfg.rpc.url,
        stale_after_seconds = cfg.negotiation.stale_after_seconds,
        max_concurrent_handlers = cfg.negotiation.max_concurrent_handlers,
        "starting lnfeed"
    );

    let ctx = Arc::new(AppContext::new(identities, feed, rpc, store));
    let live = ctx.tracker.warm().await?;
    tracing::info!(live_commands = live, "reply-chain index warmed");

    let settings = WatchSettings {
        track,
        stale_after: i64::try_from(cfg.negotiation.stale_after_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .context("negotiation.stale_after_seconds is out of range")?,
        sweep_interval: Duration::from_secs(cfg.negotiation.sweep_interval_seconds),
        max_concurrent_handlers: cfg.negotiation.max_concurrent_handlers,
        queue_capacity: cfg.negotiation.queue_capacity,
    };

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("ctrl-c received; shutting down"),
            Err(e) => tracing::warn!(%e, "ctrl-c handler failed; shutting down"),
        }
        signal_shutdown.cancel();
    });

    Arc::new(WatchLoop::new(ctx, settings)).run(shutdown).await
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = LnFeedConfig::load_with_path(config_path).await?;
    let feed = build_feed(&cfg)?;
    let rpc = build_rpc(&cfg)?;
    let identities = resolve_identities(&cfg, feed.as_ref()).await?;
    let info = rpc.get_info().await.context("node getinfo")?;
    let db_path = cfg.db_path()?;
    let store = Store::open(&db_path)
        .await
        .with_context(|| format!("open store {}", db_path.display()))?;
    let live = store.list_live().await?;

    tracing::info!(
        config_path = %cfg_path.display(),
        me = %identities.me.screen_name,
        owner = %identities.owner.screen_name,
        node_id = %info.id,
        node_alias = ?info.alias,
        node_network = ?info.network,
        node_blockheight = ?info.blockheight,
        node_uri = %info.uri(),
        db_path = %db_path.display(),
        live_commands = live.len(),
        "doctor ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let (cfg, cfg_path) = LnFeedConfig::load_with_path(config_path).await?;
    let db_path = cfg.db_path()?;
    let store = Store::open(&db_path)
        .await
        .with_context(|| format!("open store {}", db_path.display()))?;
    let commands = store.list_commands(STATUS_LIST_LIMIT).await?;
    tracing::info!(
        config_path = %cfg_path.display(),
        db_path = %db_path.display(),
        listed = commands.len(),
        "status ok"
    );

    for command in &commands {
        if json {
            println!("{}", serde_json::to_string(command)?);
            continue;
        }
        println!(
            "{}\t{}\t{}\tlast={}\tupdated={}",
            command.message_id,
            command.kind,
            command.status,
            command.last_message_id,
            command.updated_at.to_rfc3339()
        );
    }
    Ok(())
}
