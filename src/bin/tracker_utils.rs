//! tracker-utils: maintenance and inspection commands for the sharp tracker
//! database and its upstream APIs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use polymarket_sharp_tracker::POLYMARKET_BASE_URL;
use polymarket_sharp_tracker::alerts::{fmt_signed_usd, fmt_usd, format_leaderboard};
use polymarket_sharp_tracker::api::PolymarketSource;
use polymarket_sharp_tracker::catalog::list_active_markets;
use polymarket_sharp_tracker::config::{AppConfig, CONFIG_PATH};
use polymarket_sharp_tracker::profile::{ProfileSource, build_profile, classify};
use polymarket_sharp_tracker::scanner::Tracker;
use polymarket_sharp_tracker::sink::{AlertSink, ConfiguredSink, LogSink, WebhookSink};
use polymarket_sharp_tracker::store::Database;
use polymarket_sharp_tracker::types::{AlertStatus, TraderProfile};

#[derive(Parser)]
#[command(name = "tracker-utils", about = "Utilities for the Polymarket sharp tracker")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bettor and bet counts plus the top sharp bettors
    Stats,
    /// Export sharp bettors to a JSON file
    Export {
        #[arg(default_value = "sharp_bettors.json")]
        path: PathBuf,
    },
    /// Import bettors from a JSON file produced by `export`
    Import { path: PathBuf },
    /// Print the sharp bettor leaderboard
    Leaderboard {
        /// Also post it through the configured webhook
        #[arg(long)]
        post: bool,
    },
    /// List active markets for one sport (API connectivity check)
    Markets { sport: String },
    /// Evaluate a single wallet against the thresholds and store the result
    Profile { wallet: String },
    /// Scan one market now (by condition id or event slug) and alert as the
    /// tracker would
    Scan {
        market: String,
        /// Post alerts to the webhook instead of logging them
        #[arg(long)]
        live: bool,
    },
    /// Bets whose alert could not be delivered
    Pending,
    /// Delete all stored data
    ClearDb {
        #[arg(long)]
        confirm: bool,
    },
    /// Write a config file with default values
    InitConfig {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::InitConfig { force } = cli.command {
        return init_config(&cli.config, force);
    }

    let config = AppConfig::load_or_default(&cli.config)?;
    let open_store = || -> Result<Database> {
        let db = Database::open(&config.store.path)
            .with_context(|| format!("failed to open {}", config.store.path))?;
        db.initialize()?;
        Ok(db)
    };

    match cli.command {
        Command::Stats => stats(&open_store()?),
        Command::Export { path } => export(&open_store()?, &path),
        Command::Import { path } => import(&open_store()?, &config, &path),
        Command::Leaderboard { post } => leaderboard(&open_store()?, &config, post).await,
        Command::Markets { sport } => markets(&config, &sport).await,
        Command::Profile { wallet } => profile(&open_store()?, &config, &wallet).await,
        Command::Scan { market, live } => scan(open_store()?, config.clone(), &market, live).await,
        Command::Pending => pending(&open_store()?),
        Command::ClearDb { confirm } => {
            if !confirm {
                bail!("refusing to clear the database without --confirm");
            }
            open_store()?.clear()?;
            println!("Database cleared");
            Ok(())
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default().save(path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn stats(db: &Database) -> Result<()> {
    let stats = db.stats(Utc::now() - Duration::hours(24))?;
    println!("=== Tracker Stats ===");
    println!("Bettors tracked:   {}", stats.bettors);
    println!("Sharp bettors:     {}", stats.sharp_bettors);
    println!("Bets recorded:     {}", stats.bets);
    println!("Bets (last 24h):   {}", stats.bets_since);
    println!("Pending alerts:    {}", stats.pending_alerts);
    println!("Held alerts:       {}", stats.held_alerts);

    let top = db.sharp_bettors()?;
    if !top.is_empty() {
        println!("\nTop sharp bettors:");
        for (i, p) in top.iter().take(5).enumerate() {
            println!(
                "  {}. {} P&L {} ROI {:.1}%",
                i + 1,
                p.label(),
                fmt_signed_usd(p.pnl),
                p.roi
            );
        }
    }
    Ok(())
}

fn export(db: &Database, path: &Path) -> Result<()> {
    let sharp = db.sharp_bettors()?;
    let json = serde_json::to_string_pretty(&sharp)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Exported {} sharp bettor(s) to {}", sharp.len(), path.display());
    Ok(())
}

fn import(db: &Database, config: &AppConfig, path: &Path) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let profiles: Vec<TraderProfile> =
        serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    for mut p in profiles.iter().cloned() {
        p.wallet = p.wallet.to_lowercase();
        p.is_sharp = classify(&config.thresholds, p.pnl, p.roi, p.volume);
        db.upsert_bettor(&p)?;
    }
    println!("Imported {} bettor(s) from {}", profiles.len(), path.display());
    Ok(())
}

async fn leaderboard(db: &Database, config: &AppConfig, post: bool) -> Result<()> {
    let board = format_leaderboard(&db.sharp_bettors()?);
    println!("{board}");
    if post {
        let url = config
            .alerts
            .resolved_webhook_url()
            .context("--post needs alerts.webhook_url or ALERT_WEBHOOK_URL")?;
        WebhookSink::new(url, config.scan.call_timeout())?
            .post(&board)
            .await?;
        println!("Leaderboard posted");
    }
    Ok(())
}

async fn markets(config: &AppConfig, sport: &str) -> Result<()> {
    let source = PolymarketSource::new(
        config.thresholds.noise_floor,
        config.scan.holders_limit,
        config.scan.call_timeout(),
    )?;
    let listing = list_active_markets(&source, &[sport.to_string()], config.scan.call_timeout()).await;
    if let Some((_, e)) = listing.skipped_sports.first() {
        bail!("market listing for {sport} failed: {e}");
    }
    println!("Found {} active {sport} market(s)", listing.markets.len());
    for m in listing.markets.iter().take(10) {
        let prices: Vec<String> = m
            .outcomes
            .iter()
            .map(|o| format!("{} @ ${:.3}", o.label, o.price))
            .collect();
        println!("  {} [{}]", m.title, prices.join(", "));
        println!("    {POLYMARKET_BASE_URL}/event/{}", m.event_slug);
    }
    Ok(())
}

async fn profile(db: &Database, config: &AppConfig, wallet: &str) -> Result<()> {
    let wallet = wallet.to_lowercase();
    let source = PolymarketSource::new(
        config.thresholds.noise_floor,
        config.scan.holders_limit,
        config.scan.call_timeout(),
    )?;
    let stats = source.lifetime_stats(&wallet).await?;
    let p = build_profile(&wallet, &stats, &config.thresholds, Utc::now());
    let previous = db.get_bettor(&wallet)?;
    db.upsert_bettor(&p)?;

    println!("=== {} ===", p.label());
    println!("Wallet:    {}", p.wallet);
    println!("P&L:       {}", fmt_signed_usd(p.pnl));
    println!("Volume:    ${}", fmt_usd(p.volume));
    println!("ROI:       {:.1}%", p.roi);
    println!(
        "Win rate:  {:.1}% ({} of {} settled)",
        p.win_rate, stats.settled_won, stats.settled
    );
    println!("Sharp:     {}", if p.is_sharp { "yes" } else { "no" });
    if let Some(prev) = previous.filter(|prev| prev.is_sharp != p.is_sharp) {
        println!(
            "           (was {} as of {})",
            if prev.is_sharp { "sharp" } else { "not sharp" },
            prev.last_evaluated_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}

async fn scan(db: Database, config: AppConfig, wanted: &str, live: bool) -> Result<()> {
    let source = PolymarketSource::new(
        config.thresholds.noise_floor,
        config.scan.holders_limit,
        config.scan.call_timeout(),
    )?;
    let listing =
        list_active_markets(&source, &config.scan.sports, config.scan.call_timeout()).await;
    let market = listing
        .markets
        .into_iter()
        .find(|m| m.id == wanted || m.event_slug == wanted)
        .with_context(|| format!("no active market matches {wanted}"))?;

    let sink = if live {
        let url = config
            .alerts
            .resolved_webhook_url()
            .context("--live needs alerts.webhook_url or ALERT_WEBHOOK_URL")?;
        ConfiguredSink::Live(WebhookSink::new(url, config.scan.call_timeout())?)
    } else {
        ConfiguredSink::DryRun(LogSink)
    };

    println!("Scanning \"{}\" ({})", market.title, market.id);
    let mut tracker = Tracker::new(config, source, sink, db)?;
    let report = tracker.scan_market(&market, Utc::now()).await;
    println!(
        "{} event(s), {} alert(s), {} held, {} suppressed",
        report.events_detected, report.alerts_emitted, report.alerts_held, report.alerts_suppressed
    );
    if report.seeding {
        println!("Store was empty: positions recorded without alerting");
    }
    if report.markets_deferred > 0 {
        bail!("market could not be read; see logs");
    }
    Ok(())
}

fn pending(db: &Database) -> Result<()> {
    let rows = db.bets_with_status(AlertStatus::Pending)?;
    if rows.is_empty() {
        println!("No pending alerts");
        return Ok(());
    }
    println!("{} pending alert(s):", rows.len());
    for b in &rows {
        println!(
            "  #{} {} {} ${} on {} @ ${:.3} in \"{}\"",
            b.id,
            b.timestamp.to_rfc3339(),
            b.bettor_address,
            fmt_usd(b.amount),
            b.outcome,
            b.price,
            b.market_title
        );
    }
    Ok(())
}
