//! Claude Code Usage Collector - server entry point

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claude_code_usage_collector_lib::usage::{
    get_data_dir, parse_listen_addr, parse_timezone, Plan, RetentionPolicy, ServerConfig,
    DEFAULT_LISTEN_ADDR,
};

/// Collect Claude Code OpenTelemetry usage events and serve usage queries
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on for OTLP exports and queries
    #[arg(long, env = "CCM_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Directory holding the usage database
    #[arg(long, env = "CCM_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Shared secret expected verbatim in the `authorization` header.
    /// Empty disables authentication.
    #[arg(long, env = "CCM_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    auth_token: String,

    /// Drop records older than this many days (0 keeps them forever)
    #[arg(long, env = "CCM_RETENTION_DAYS", default_value_t = 30)]
    retention_days: u64,

    /// Keep at most this many records (0 for no cap)
    #[arg(long, env = "CCM_MAX_RECORDS", default_value_t = 10_000)]
    max_records: usize,

    /// Minutes between retention sweeps
    #[arg(long, env = "CCM_SWEEP_MINUTES", default_value_t = 60)]
    sweep_minutes: u64,

    /// Seconds a computed stats result is reused
    #[arg(long, env = "CCM_CACHE_TTL_SECS", default_value_t = 60)]
    cache_ttl_secs: u64,

    /// IANA timezone for calendar periods and block anchors
    #[arg(long, env = "CCM_TIMEZONE", default_value = "UTC")]
    timezone: String,

    /// Subscription plan: pro, max, max20
    #[arg(long, env = "CCM_PLAN", default_value = "")]
    plan: String,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => get_data_dir(None),
        };

        Ok(ServerConfig {
            listen_addr: parse_listen_addr(&self.listen)?,
            data_dir,
            auth_token: self.auth_token,
            retention: RetentionPolicy::from_units(self.retention_days, self.max_records, self.sweep_minutes)?,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            timezone: parse_timezone(&self.timezone)?,
            plan: Plan::from_name(&self.plan),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    log::info!(
        "Starting Claude Code usage collector v{} (data dir {})",
        env!("CARGO_PKG_VERSION"),
        config.data_dir.display()
    );

    let running = claude_code_usage_collector_lib::start(&config)
        .await
        .context("failed to start collector")?;
    log::info!("Listening on {}", running.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    log::info!("Shutdown requested");

    running.shutdown().await;
    Ok(())
}
