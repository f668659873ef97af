//! lnfeed: negotiates Lightning node operations with other people's bots over a
//! public, reply-threaded message feed.

mod classifier;
mod config;
mod context;
mod error;
mod model;
mod negotiation;
mod resolver;
mod runtime;
mod store;
#[cfg(test)]
mod testing;
mod tracker;
mod watch;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Parser)]
#[command(name = "lnfeed", version, about = "Lightning node negotiation bot for a public message feed")]
struct Cli {
    /// Config file. Default: ~/.lnfeed/config.toml
    #[arg(long, global = true, env = "LNFEED_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the feed and drive negotiations (default).
    Watch,
    /// Validate config, resolve feed identities and query the node.
    Doctor,
    /// List recently updated negotiations from the store.
    Status {
        /// One JSON object per line instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(anyhow::anyhow!("load .env: {e}"));
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => runtime::watch(cli.config).await,
        Command::Doctor => runtime::doctor(cli.config).await,
        Command::Status { json } => runtime::status(cli.config, json).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(anyhow::anyhow!(
                "unsupported LNFEED_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            )),
        }
    }
}

/// Logs go to stderr; stdout is reserved for command output such as `status --json`.
fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,lnfeed=debug,lnf_app=debug,lnf_feed=debug,lnf_rpc=debug",
        ),
    };
    let log_format: LogFormat = std::env::var("LNFEED_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .parse()?;

    tracing::subscriber::set_global_default(build_subscriber(
        log_format,
        env_filter,
        std::io::stderr,
    ))
    .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;
    tracing::info!(
        log_format = ?log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn build_subscriber<W>(
    format: LogFormat,
    env_filter: EnvFilter,
    writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_target(true);
    match format {
        LogFormat::Json => Box::new(
            builder
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .finish(),
        ),
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(
            panic_location = ?panic_info.location().map(|l| format!("{}:{}", l.file(), l.line())),
            panic_payload = %message,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}
