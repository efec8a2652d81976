//! sharp-tracker: polls Polymarket sports markets and alerts when a
//! historically profitable wallet places a new large bet.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use polymarket_sharp_tracker::api::PolymarketSource;
use polymarket_sharp_tracker::config::{AppConfig, CONFIG_PATH};
use polymarket_sharp_tracker::scanner::{Tracker, run_and_report};
use polymarket_sharp_tracker::sink::{ConfiguredSink, LogSink, WebhookSink};
use polymarket_sharp_tracker::store::Database;

#[derive(Parser)]
#[command(name = "sharp-tracker", about = "Polymarket sharp bettor alert tracker")]
struct Args {
    /// Log alerts instead of posting them
    #[arg(long, conflicts_with = "live")]
    dry_run: bool,

    /// Post alerts to the configured webhook
    #[arg(long, conflicts_with = "dry_run")]
    live: bool,

    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run a single scan cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = AppConfig::load_or_default(&args.config)?;
    info!("Loaded config from {}", args.config.display());

    let live = if args.live {
        true
    } else if args.dry_run {
        false
    } else {
        config.alerts.live
    };

    let sink = if live {
        let url = config
            .alerts
            .resolved_webhook_url()
            .context("live mode needs alerts.webhook_url or ALERT_WEBHOOK_URL")?;
        ConfiguredSink::Live(WebhookSink::new(url, config.scan.call_timeout())?)
    } else {
        ConfiguredSink::DryRun(LogSink)
    };

    let store = Database::open(&config.store.path)
        .with_context(|| format!("failed to open {}", config.store.path))?;
    store.initialize().context("failed to initialize schema")?;

    let source = PolymarketSource::new(
        config.thresholds.noise_floor,
        config.scan.holders_limit,
        config.scan.call_timeout(),
    )?;

    let mode = if live { "live" } else { "dry-run" };
    let poll_interval = config.scan.poll_interval();
    info!(
        "Starting sharp-tracker ({mode}): sports={} min_pnl={} min_roi={}% min_volume={} min_bet={} poll={}s",
        config.scan.sports.join(","),
        config.thresholds.min_pnl,
        config.thresholds.min_roi,
        config.thresholds.min_volume,
        config.thresholds.min_bet_alert,
        poll_interval.as_secs(),
    );

    let mut tracker = Tracker::new(config, source, sink, store)?;

    if args.once {
        run_and_report(&mut tracker).await?;
        return Ok(());
    }

    info!("Entering scan loop. Press Ctrl+C to stop.");
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = run_and_report(&mut tracker).await {
                    warn!("Scan cycle error: {e}");
                }
            }
        }
    }

    Ok(())
}
