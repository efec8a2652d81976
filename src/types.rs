use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a market as reported by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Active,
    Closed,
}

/// One labelled outcome of a market with its current price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub label: String,
    pub price: f64,
}

/// A sports market, keyed by its condition id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub title: String,
    pub sport: String,
    pub status: MarketStatus,
    pub outcomes: Vec<Outcome>,
    pub event_slug: String,
}

/// Lifetime profitability metrics for one wallet.
///
/// `win_rate` and `roi` are percentages (15.0 means 15%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderProfile {
    pub wallet: String,
    pub display_name: Option<String>,
    pub pnl: f64,
    pub volume: f64,
    pub win_rate: f64,
    pub roi: f64,
    pub is_sharp: bool,
    pub last_evaluated_at: DateTime<Utc>,
}

impl TraderProfile {
    /// Display name, falling back to the shortened wallet.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => short_wallet(&self.wallet),
        }
    }
}

/// `0x1234...abcd` form of a wallet address.
pub fn short_wallet(wallet: &str) -> String {
    let chars: Vec<char> = wallet.chars().collect();
    if chars.len() <= 10 {
        return wallet.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// A (trader, outcome) pair inside one market.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub trader: String,
    pub outcome: String,
}

impl PositionKey {
    pub fn new(trader: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            trader: trader.into(),
            outcome: outcome.into(),
        }
    }
}

/// Observed holding of a trader in one market outcome.
///
/// `size` is the USD cost basis of the holding, so price drift alone never
/// looks like a new bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trader: String,
    pub market_id: String,
    pub outcome: String,
    pub size: f64,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.trader.clone(), self.outcome.clone())
    }
}

/// What a snapshot knows about one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionRead<'a> {
    Observed(&'a Position),
    /// The trader was re-scanned and holds nothing above the noise floor here.
    ConfirmedZero,
    /// The trader could not be read (or was not a candidate) this cycle.
    Unknown,
}

/// All positions observed for one market in one scan cycle.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub market: Market,
    pub taken_at: DateTime<Utc>,
    pub positions: HashMap<PositionKey, Position>,
    /// Traders whose read succeeded, including those holding nothing.
    pub rescanned: HashSet<String>,
    /// Traders whose read failed; their keys are unknown.
    pub skipped: Vec<String>,
}

impl MarketSnapshot {
    pub fn new(market: Market, taken_at: DateTime<Utc>) -> Self {
        Self {
            market,
            taken_at,
            positions: HashMap::new(),
            rescanned: HashSet::new(),
            skipped: Vec::new(),
        }
    }

    pub fn read(&self, key: &PositionKey) -> PositionRead<'_> {
        if let Some(pos) = self.positions.get(key) {
            PositionRead::Observed(pos)
        } else if self.rescanned.contains(&key.trader) {
            PositionRead::ConfirmedZero
        } else {
            PositionRead::Unknown
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Demote a trader from re-scanned to unknown for this cycle.
    ///
    /// Used when a trader's profile cannot be resolved, so the change is
    /// re-examined next cycle instead of being absorbed silently.
    pub fn defer_trader(&mut self, trader: &str) {
        self.positions.retain(|key, _| key.trader != trader);
        if self.rescanned.remove(trader) {
            self.skipped.push(trader.to_string());
        }
    }
}

/// A detected increase of a position (or a brand-new position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetEvent {
    pub trader: String,
    pub market_id: String,
    pub market_title: String,
    pub sport: String,
    pub outcome: String,
    pub delta: f64,
    /// Position size after this bet.
    pub cumulative_size: f64,
    pub price: f64,
    pub detected_at: DateTime<Utc>,
}

/// Marker that a (trader, market, outcome) key has been announced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub trader: String,
    pub market_id: String,
    pub outcome: String,
    /// Cumulative position size at the time of the last alert.
    pub alerted_amount: f64,
    pub alerted_at: DateTime<Utc>,
}

/// Why the coordinator held an event back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    Duplicate,
    RateLimited,
    NotSharp,
}

/// Human-readable alert ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub trader: String,
    pub market_id: String,
    pub outcome: String,
    pub amount: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertDecision {
    Emit(AlertPayload),
    Suppress(SuppressReason),
}

/// Delivery state of a bet ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Recorded but never considered for an alert (e.g. not sharp).
    None,
    Suppressed,
    DryRun,
    Delivered,
    /// Persisted as alerted but the sink failed; needs operator attention.
    Pending,
    /// Held back by the hourly cap; replayed once the cap allows.
    RateLimited,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::None => "none",
            AlertStatus::Suppressed => "suppressed",
            AlertStatus::DryRun => "dry_run",
            AlertStatus::Delivered => "delivered",
            AlertStatus::Pending => "pending",
            AlertStatus::RateLimited => "rate_limited",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(AlertStatus::None),
            "suppressed" => Some(AlertStatus::Suppressed),
            "dry_run" => Some(AlertStatus::DryRun),
            "delivered" => Some(AlertStatus::Delivered),
            "pending" => Some(AlertStatus::Pending),
            "rate_limited" => Some(AlertStatus::RateLimited),
            _ => None,
        }
    }
}

/// Summary of one scan cycle, emitted as a JSON line.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: String,
    pub finished_at: String,
    pub seeding: bool,
    pub aborted: Option<String>,
    pub skipped_sports: Vec<String>,
    pub markets_listed: usize,
    pub markets_scanned: usize,
    pub markets_deferred: usize,
    /// Tracked markets dropped because the catalog no longer lists them.
    pub markets_pruned: usize,
    pub partial_markets: usize,
    pub traders_skipped: usize,
    pub profiles_refreshed: usize,
    pub profiles_stale: usize,
    pub withdrawals: usize,
    pub events_detected: usize,
    pub alerts_emitted: usize,
    pub alerts_suppressed: usize,
    /// Events held back by the hourly cap this cycle.
    pub alerts_held: usize,
    /// Held events delivered this cycle.
    pub alerts_replayed: usize,
    /// Events whose ledger or alert write failed; re-detected next cycle.
    pub event_failures: usize,
    pub sink_failures: usize,
    pub leaderboard_posted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> Market {
        Market {
            id: "0xm".to_string(),
            title: "Lakers vs Celtics".to_string(),
            sport: "nba".to_string(),
            status: MarketStatus::Active,
            outcomes: vec![
                Outcome {
                    label: "Lakers".to_string(),
                    price: 0.652,
                },
                Outcome {
                    label: "Celtics".to_string(),
                    price: 0.348,
                },
            ],
            event_slug: "nba-lal-bos".to_string(),
        }
    }

    fn position(trader: &str, outcome: &str, size: f64) -> Position {
        Position {
            trader: trader.to_string(),
            market_id: "0xm".to_string(),
            outcome: outcome.to_string(),
            size,
            price: 0.5,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn short_wallet_formats() {
        assert_eq!(
            short_wallet("0xdb27bf2ac5d428a9c63dbc914611036855a6c56e"),
            "0xdb27...c56e"
        );
        assert_eq!(short_wallet("0xabc"), "0xabc");
        // multi-byte input must not split a character
        assert_eq!(short_wallet("ééééééééééééé"), "éééééé...éééé");
    }

    #[test]
    fn profile_label_falls_back_to_wallet() {
        let mut p = TraderProfile {
            wallet: "0xdb27bf2ac5d428a9c63dbc914611036855a6c56e".to_string(),
            display_name: Some("  ".to_string()),
            pnl: 0.0,
            volume: 0.0,
            win_rate: 0.0,
            roi: 0.0,
            is_sharp: false,
            last_evaluated_at: Utc::now(),
        };
        assert_eq!(p.label(), "0xdb27...c56e");
        p.display_name = Some("DrPufferfish".to_string());
        assert_eq!(p.label(), "DrPufferfish");
    }

    #[test]
    fn snapshot_read_distinguishes_zero_and_unknown() {
        let mut snap = MarketSnapshot::new(market(), Utc::now());
        let pos = position("0xa", "Lakers", 2000.0);
        snap.positions.insert(pos.key(), pos);
        snap.rescanned.insert("0xa".to_string());
        snap.rescanned.insert("0xb".to_string());
        snap.skipped.push("0xc".to_string());

        assert!(matches!(
            snap.read(&PositionKey::new("0xa", "Lakers")),
            PositionRead::Observed(p) if p.size == 2000.0
        ));
        assert_eq!(
            snap.read(&PositionKey::new("0xa", "Celtics")),
            PositionRead::ConfirmedZero
        );
        assert_eq!(
            snap.read(&PositionKey::new("0xb", "Lakers")),
            PositionRead::ConfirmedZero
        );
        assert_eq!(
            snap.read(&PositionKey::new("0xc", "Lakers")),
            PositionRead::Unknown
        );
        assert!(snap.is_partial());
    }

    #[test]
    fn defer_trader_turns_keys_unknown() {
        let mut snap = MarketSnapshot::new(market(), Utc::now());
        let pos = position("0xa", "Lakers", 2000.0);
        snap.positions.insert(pos.key(), pos);
        snap.rescanned.insert("0xa".to_string());

        snap.defer_trader("0xa");
        assert_eq!(
            snap.read(&PositionKey::new("0xa", "Lakers")),
            PositionRead::Unknown
        );
        assert_eq!(snap.skipped, vec!["0xa".to_string()]);
        // deferring twice does not duplicate the skip entry
        snap.defer_trader("0xa");
        assert_eq!(snap.skipped.len(), 1);
    }

    #[test]
    fn alert_status_round_trips_strings() {
        for status in [
            AlertStatus::None,
            AlertStatus::Suppressed,
            AlertStatus::DryRun,
            AlertStatus::Delivered,
            AlertStatus::Pending,
            AlertStatus::RateLimited,
        ] {
            assert_eq!(AlertStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(AlertStatus::from_str("bogus"), None);
    }
}
