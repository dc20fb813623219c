//! Query a running usage collector
//!
//! Run with: cargo run --bin usage_query -- stats --hours 24

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use claude_code_usage_collector_lib::commands::{BlockRequest, StatsResponse, SummaryRequest, TokenDto};
use claude_code_usage_collector_lib::usage::telemetry::UsageClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Query a Claude Code usage collector", long_about = None)]
struct Cli {
    /// Collector base URL
    #[arg(long, env = "CCM_URL", default_value = "http://127.0.0.1:4317")]
    url: String,

    /// Token sent verbatim as the `authorization` header
    #[arg(long, env = "CCM_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    auth_token: String,

    /// Server-side deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct Range {
    /// Range start (RFC 3339); defaults to `--hours` before now
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// Range end (RFC 3339); defaults to now
    #[arg(long)]
    end: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 24)]
    hours: u32,
}

impl Range {
    fn resolve(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = match self.start {
            Some(start) => start,
            None => end
                .checked_sub_signed(chrono::Duration::hours(i64::from(self.hours)))
                .with_context(|| format!("--hours {} reaches before the earliest date", self.hours))?,
        };
        Ok((start, end))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Aggregated stats split by model tier
    Stats(Range),
    /// One page of individual requests
    Requests {
        #[command(flatten)]
        range: Range,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Every request in the range as JSON lines
    Stream(Range),
    /// Progress of the current 5-hour block
    Block {
        /// Local hour the first block of the day starts at
        #[arg(long, default_value_t = 0)]
        anchor_hour: u32,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        token_limit: Option<u64>,
        #[arg(long)]
        plan: Option<String>,
    },
    /// Today's and this month's usage against a plan
    Summary {
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        plan: Option<String>,
    },
}

fn print_tokens(label: &str, tokens: &TokenDto) {
    println!(
        "  {:<8} input={} output={} cache_read={} cache_creation={} total={}",
        label, tokens.input, tokens.output, tokens.cache_read, tokens.cache_creation, tokens.total
    );
}

fn print_stats(title: &str, stats: &StatsResponse) {
    println!("=== {} ({} .. {}) ===", title, stats.start_time, stats.end_time);
    println!(
        "Requests: {} (base {}, premium {})",
        stats.total_requests, stats.base_requests, stats.premium_requests
    );
    print_tokens("base", &stats.base_tokens);
    print_tokens("premium", &stats.premium_tokens);
    print_tokens("total", &stats.total_tokens);
    println!(
        "Cost: ${:.4} (base ${:.4}, premium ${:.4})",
        stats.total_cost, stats.base_cost, stats.premium_cost
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut client = UsageClient::new(&cli.url, &cli.auth_token);
    if let Some(ms) = cli.timeout_ms {
        client = client.with_timeout(Duration::from_millis(ms));
    }

    match cli.command {
        Command::Stats(range) => {
            let (start, end) = range.resolve()?;
            let stats = client.stats(start, end).await.context("stats query failed")?;
            print_stats("Stats", &stats);
        }
        Command::Requests { range, limit, offset } => {
            let (start, end) = range.resolve()?;
            let requests = client
                .requests(start, end, limit, offset)
                .await
                .context("requests query failed")?;
            for r in &requests {
                println!(
                    "{}  {:<28} {:<36} in={:<7} out={:<7} ${:.4} {}ms",
                    r.timestamp, r.model, r.session_id, r.input_tokens, r.output_tokens, r.cost_usd, r.duration_ms
                );
            }
            println!("{} requests", requests.len());
        }
        Command::Stream(range) => {
            let (start, end) = range.resolve()?;
            let mut failed = None;
            let count = client
                .stream_requests(start, end, |r| {
                    if failed.is_none() {
                        match serde_json::to_string(&r) {
                            Ok(line) => println!("{}", line),
                            Err(e) => failed = Some(e),
                        }
                    }
                })
                .await
                .context("stream query failed")?;
            if let Some(e) = failed {
                return Err(e).context("failed to render record");
            }
            eprintln!("{} requests", count);
        }
        Command::Block { anchor_hour, timezone, token_limit, plan } => {
            let block = client
                .block(&BlockRequest { anchor_hour, timezone, token_limit, plan })
                .await
                .context("block query failed")?;
            println!("Block: {}", block.label);
            match block.token_limit {
                Some(limit) => println!(
                    "Used: {} / {} tokens ({:.1}%, raw {:.1}%)",
                    block.used_tokens, limit, block.clamped_percentage, block.percentage
                ),
                None => println!("Used: {} tokens (no limit)", block.used_tokens),
            }
            println!(
                "Resets in {}h {}m",
                block.remaining_seconds / 3600,
                (block.remaining_seconds % 3600) / 60
            );
        }
        Command::Summary { timezone, plan } => {
            let summary = client
                .summary(&SummaryRequest { timezone, plan })
                .await
                .context("summary query failed")?;
            print_stats("Today", &summary.daily);
            print_stats("This month", &summary.monthly);
            println!(
                "Plan {} (${:.0}): {}% today, {}% this month",
                summary.plan, summary.plan_price, summary.daily_plan_usage, summary.monthly_plan_usage
            );
        }
    }

    Ok(())
}
