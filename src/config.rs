use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Environment variable that overrides `alerts.webhook_url`.
pub const WEBHOOK_ENV: &str = "ALERT_WEBHOOK_URL";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Sharp classification and alerting thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum lifetime profit in USD.
    #[serde(default = "default_min_pnl")]
    pub min_pnl: f64,
    /// Minimum lifetime ROI in percent.
    #[serde(default = "default_min_roi")]
    pub min_roi: f64,
    /// Minimum lifetime volume in USD.
    #[serde(default = "default_min_volume")]
    pub min_volume: f64,
    /// Minimum position increase in USD that counts as a bet worth alerting.
    #[serde(default = "default_min_bet_alert")]
    pub min_bet_alert: f64,
    /// Positions below this USD size are not snapshotted.
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,
}

fn default_min_pnl() -> f64 {
    10_000.0
}

fn default_min_roi() -> f64 {
    10.0
}

fn default_min_volume() -> f64 {
    50_000.0
}

fn default_min_bet_alert() -> f64 {
    5_000.0
}

fn default_noise_floor() -> f64 {
    1_000.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_pnl: default_min_pnl(),
            min_roi: default_min_roi(),
            min_volume: default_min_volume(),
            min_bet_alert: default_min_bet_alert(),
            noise_floor: default_noise_floor(),
        }
    }
}

/// Scan cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Sport tags to scan.
    #[serde(default = "default_sports")]
    pub sports: Vec<String>,
    /// Seconds between the start of consecutive cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Hard deadline for a whole cycle.
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,
    /// Timeout applied to every individual network call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Top holders requested per market.
    #[serde(default = "default_holders_limit")]
    pub holders_limit: u32,
    /// Concurrent per-trader position reads within one market.
    #[serde(default = "default_trader_concurrency")]
    pub trader_concurrency: usize,
    /// How long an evaluated profile stays fresh.
    #[serde(default = "default_profile_ttl")]
    pub profile_ttl_secs: u64,
    /// Record positions without alerting when no prior state exists.
    #[serde(default = "default_true")]
    pub seed_on_start: bool,
}

fn default_sports() -> Vec<String> {
    ["mlb", "nfl", "nba", "nhl", "ncaa-basketball"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_poll_interval() -> u64 {
    30 * 60
}

fn default_cycle_timeout() -> u64 {
    20 * 60
}

fn default_call_timeout() -> u64 {
    15
}

fn default_holders_limit() -> u32 {
    20
}

fn default_trader_concurrency() -> usize {
    4
}

fn default_profile_ttl() -> u64 {
    6 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sports: default_sports(),
            poll_interval_secs: default_poll_interval(),
            cycle_timeout_secs: default_cycle_timeout(),
            call_timeout_secs: default_call_timeout(),
            holders_limit: default_holders_limit(),
            trader_concurrency: default_trader_concurrency(),
            profile_ttl_secs: default_profile_ttl(),
            seed_on_start: default_true(),
        }
    }
}

impl ScanConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn profile_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.profile_ttl_secs as i64)
    }
}

/// Alert emission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Post alerts to the webhook. When false the tracker runs dry.
    #[serde(default)]
    pub live: bool,
    /// Discord/Slack-compatible webhook receiving `{"content": ...}`.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Repeat bets on the same key are suppressed for this long.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    /// Cap on emitted alerts over any rolling hour.
    #[serde(default = "default_max_alerts_per_hour")]
    pub max_alerts_per_hour: u32,
    /// Minimum spacing between consecutive posts.
    #[serde(default = "default_post_interval")]
    pub post_interval_secs: u64,
    /// Post the sharp bettor leaderboard once a day.
    #[serde(default = "default_true")]
    pub daily_leaderboard: bool,
    /// UTC hour after which the daily leaderboard is posted.
    #[serde(default = "default_leaderboard_hour")]
    pub leaderboard_hour_utc: u32,
}

fn default_dedup_window() -> u64 {
    12 * 60 * 60
}

fn default_max_alerts_per_hour() -> u32 {
    20
}

fn default_post_interval() -> u64 {
    5
}

fn default_leaderboard_hour() -> u32 {
    12
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            live: false,
            webhook_url: None,
            dedup_window_secs: default_dedup_window(),
            max_alerts_per_hour: default_max_alerts_per_hour(),
            post_interval_secs: default_post_interval(),
            daily_leaderboard: default_true(),
            leaderboard_hour_utc: default_leaderboard_hour(),
        }
    }
}

impl AlertConfig {
    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    pub fn post_interval(&self) -> Duration {
        Duration::from_secs(self.post_interval_secs)
    }

    /// Webhook from the environment if set, otherwise from the file.
    pub fn resolved_webhook_url(&self) -> Option<String> {
        std::env::var(WEBHOOK_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.webhook_url.clone().filter(|s| !s.is_empty()))
    }
}

/// Persistent store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "polymarket_tracker.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan.sports.is_empty() {
            anyhow::bail!("scan.sports must name at least one sport");
        }
        if self.thresholds.min_bet_alert <= 0.0 {
            anyhow::bail!("thresholds.min_bet_alert must be positive");
        }
        if self.thresholds.noise_floor < 0.0 {
            anyhow::bail!("thresholds.noise_floor cannot be negative");
        }
        if self.scan.trader_concurrency == 0 {
            anyhow::bail!("scan.trader_concurrency must be at least 1");
        }
        if self.scan.call_timeout_secs == 0 || self.scan.cycle_timeout_secs == 0 {
            anyhow::bail!("timeouts must be positive");
        }
        if self.alerts.leaderboard_hour_utc > 23 {
            anyhow::bail!("alerts.leaderboard_hour_utc must be between 0 and 23");
        }
        Ok(())
    }
}
