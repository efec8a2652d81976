use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use tracing::{debug, info};

use crate::error::TrackerResult;
use crate::store::Database;
use crate::types::{
    AlertDecision, AlertPayload, AlertRecord, BetEvent, SuppressReason, TraderProfile,
    short_wallet,
};

type AlertKey = (String, String, String);

fn key_of(trader: &str, market_id: &str, outcome: &str) -> AlertKey {
    (trader.to_string(), market_id.to_string(), outcome.to_string())
}

/// Decides which bet events become alerts.
///
/// Holds the dedup records (mirrored in the store) and the timestamps of
/// recent emits for the hourly cap. Records expire lazily: an old record is
/// simply ignored once `alerted_at + dedup_window` has passed.
pub struct AlertCoordinator {
    dedup_window: Duration,
    min_bet_alert: f64,
    max_per_hour: u32,
    records: HashMap<AlertKey, AlertRecord>,
    recent_emits: Vec<DateTime<Utc>>,
}

impl AlertCoordinator {
    pub fn new(
        dedup_window: Duration,
        min_bet_alert: f64,
        max_per_hour: u32,
        stored: Vec<AlertRecord>,
    ) -> Self {
        let records = stored
            .into_iter()
            .map(|r| (key_of(&r.trader, &r.market_id, &r.outcome), r))
            .collect();
        Self {
            dedup_window,
            min_bet_alert,
            max_per_hour,
            records,
            recent_emits: Vec::new(),
        }
    }

    pub fn record(&self, trader: &str, market_id: &str, outcome: &str) -> Option<&AlertRecord> {
        self.records.get(&key_of(trader, market_id, outcome))
    }

    fn is_duplicate(&self, event: &BetEvent, now: DateTime<Utc>) -> bool {
        match self.record(&event.trader, &event.market_id, &event.outcome) {
            Some(rec) if now - rec.alerted_at < self.dedup_window => {
                event.cumulative_size < rec.alerted_amount + self.min_bet_alert
            }
            _ => false,
        }
    }

    /// Sliding one-hour window; `max_per_hour == 0` disables the cap.
    fn rate_limited(&mut self, now: DateTime<Utc>) -> bool {
        if self.max_per_hour == 0 {
            return false;
        }
        let cutoff = now - Duration::hours(1);
        self.recent_emits.retain(|t| *t > cutoff);
        self.recent_emits.len() >= self.max_per_hour as usize
    }

    /// Decide whether `event` is announced.
    ///
    /// On `Emit` the dedup record has already been written to `store`, so a
    /// crash after this point can never cause the same alert twice.
    pub fn consider(
        &mut self,
        event: &BetEvent,
        profile: Option<&TraderProfile>,
        store: &Database,
        now: DateTime<Utc>,
    ) -> TrackerResult<AlertDecision> {
        let Some(profile) = profile.filter(|p| p.is_sharp) else {
            return Ok(AlertDecision::Suppress(SuppressReason::NotSharp));
        };

        if self.is_duplicate(event, now) {
            debug!(
                "Duplicate alert for {} on {} / {} suppressed",
                event.trader, event.market_id, event.outcome
            );
            return Ok(AlertDecision::Suppress(SuppressReason::Duplicate));
        }

        if self.rate_limited(now) {
            info!(
                "Hourly alert cap ({}) reached; holding back {} on {}",
                self.max_per_hour, event.trader, event.market_id
            );
            return Ok(AlertDecision::Suppress(SuppressReason::RateLimited));
        }

        let record = AlertRecord {
            trader: event.trader.clone(),
            market_id: event.market_id.clone(),
            outcome: event.outcome.clone(),
            alerted_amount: event.cumulative_size,
            alerted_at: now,
        };
        store.upsert_alert(&record)?;
        self.records.insert(
            key_of(&record.trader, &record.market_id, &record.outcome),
            record,
        );
        self.recent_emits.push(now);

        Ok(AlertDecision::Emit(AlertPayload {
            trader: event.trader.clone(),
            market_id: event.market_id.clone(),
            outcome: event.outcome.clone(),
            amount: event.delta,
            text: format_alert(event, profile),
        }))
    }
}

/// Whole dollars with thousands separators: `127430.4` -> `127,430`.
pub fn fmt_usd(amount: f64) -> String {
    let rounded = amount.abs().round() as u64;
    let digits = rounded.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `+$1,234` / `-$1,234`.
pub fn fmt_signed_usd(amount: f64) -> String {
    let sign = if amount < 0.0 { '-' } else { '+' };
    format!("{sign}${}", fmt_usd(amount))
}

fn sport_hashtag(sport: &str) -> String {
    let tag: String = sport
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();
    format!("#{tag}")
}

pub fn format_alert(event: &BetEvent, profile: &TraderProfile) -> String {
    let name = profile
        .display_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or("Unknown");
    format!(
        "🚨 SHARP BETTOR ALERT\n\
         \n\
         {name} ({wallet})\n\
         💰 Lifetime P&L: {pnl}\n\
         📊 ROI: {roi:.1}%\n\
         \n\
         Just bet ${amount} on:\n\
         📍 {title}\n\
         🎯 {outcome} @ ${price:.3}\n\
         \n\
         {tag} #Polymarket #SharpBettors",
        wallet = short_wallet(&event.trader),
        pnl = fmt_signed_usd(profile.pnl),
        roi = profile.roi,
        amount = fmt_usd(event.delta),
        title = event.market_title,
        outcome = event.outcome,
        price = event.price,
        tag = sport_hashtag(&event.sport),
    )
}

/// Top ten sharp bettors, in the order given (the store sorts by ROI).
pub fn format_leaderboard(profiles: &[TraderProfile]) -> String {
    let mut out = String::from("🏆 TOP SHARP BETTORS ON POLYMARKET\n\n");
    for (i, p) in profiles.iter().take(10).enumerate() {
        out.push_str(&format!(
            "{rank}. {name}\n   💰 P&L: {pnl}\n   📊 ROI: {roi:.1}%\n   🎯 Win Rate: {win:.1}%\n\n",
            rank = i + 1,
            name = p.label(),
            pnl = fmt_signed_usd(p.pnl),
            roi = p.roi,
            win = p.win_rate,
        ));
    }
    out
}

/// The daily leaderboard is due once `now` has reached `hour_utc` on a day
/// it has not been posted yet.
pub fn leaderboard_due(hour_utc: u32, last_posted: Option<NaiveDate>, now: DateTime<Utc>) -> bool {
    now.hour() >= hour_utc && last_posted.is_none_or(|day| day < now.date_naive())
}
