//! One scan cycle end to end: list markets, snapshot each one, evaluate the
//! traders that moved, detect bets, then commit state and hand alerts to the
//! sink.
//!
//! A market is processed in two phases. Gathering (network reads and profile
//! lookups) runs under the cycle deadline and can be abandoned at any await
//! point without side effects. Committing (store, alerts, then the index) runs
//! only for fully gathered markets.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::alerts::{AlertCoordinator, format_leaderboard, leaderboard_due};
use crate::catalog::{MarketSource, list_active_markets};
use crate::config::AppConfig;
use crate::detector::{PositionIndex, candidate_traders, detect};
use crate::error::TrackerResult;
use crate::profile::{Freshness, ProfileEvaluator, ProfileSource};
use crate::reporter;
use crate::sink::{AlertSink, post_with_timeout};
use crate::snapshot::{PositionSource, Snapshotter};
use crate::store::Database;
use crate::types::{
    AlertDecision, AlertPayload, AlertStatus, BetEvent, CycleReport, Market, MarketSnapshot,
    PositionKey, SuppressReason, TraderProfile,
};

/// `tracker_state` key holding the UTC date of the last leaderboard post.
const LEADERBOARD_POSTED_KEY: &str = "leaderboard_posted_on";

/// State threaded from one cycle to the next.
pub struct ScanContext {
    pub config: AppConfig,
    /// Last known positions; the "previous snapshot" for every market.
    pub index: PositionIndex,
    pub cycle: u64,
    /// Record positions without alerting until every listed market has been
    /// committed once.
    pub seeding: bool,
    /// Markets committed while seeding.
    pub seeded: HashSet<String>,
}

impl ScanContext {
    fn seeds(&self, market_id: &str) -> bool {
        self.seeding && !self.seeded.contains(market_id)
    }
}

/// A market whose reads all finished; nothing has been committed yet.
struct GatheredMarket {
    snapshot: MarketSnapshot,
    profiles: HashMap<String, TraderProfile>,
    refreshed: Vec<TraderProfile>,
    stale: usize,
}

/// Upstream data needed by a cycle.
pub trait TrackerSource: MarketSource + PositionSource + ProfileSource {}

impl<T: MarketSource + PositionSource + ProfileSource> TrackerSource for T {}

pub struct Tracker<S, K> {
    source: S,
    sink: K,
    store: Database,
    ctx: ScanContext,
    snapshotter: Snapshotter,
    evaluator: ProfileEvaluator,
    coordinator: AlertCoordinator,
    last_post: Option<tokio::time::Instant>,
}

impl<S: TrackerSource, K: AlertSink> Tracker<S, K> {
    /// Build a tracker, restoring profiles, alert records and positions from
    /// `store`.
    pub fn new(config: AppConfig, source: S, sink: K, store: Database) -> TrackerResult<Self> {
        let index = PositionIndex::from_positions(store.load_positions()?);
        let seeding = config.scan.seed_on_start && index.is_empty();

        let evaluator = ProfileEvaluator::new(
            config.thresholds.clone(),
            config.scan.profile_ttl(),
            config.scan.call_timeout(),
            store.load_profiles()?,
        );
        let coordinator = AlertCoordinator::new(
            config.alerts.dedup_window(),
            config.thresholds.min_bet_alert,
            config.alerts.max_alerts_per_hour,
            store.load_alerts()?,
        );
        let snapshotter = Snapshotter::new(
            config.thresholds.noise_floor,
            config.scan.call_timeout(),
            config.scan.trader_concurrency,
        );

        info!(
            "Restored {} profile(s), {} tracked market(s){}",
            evaluator.len(),
            index.market_count(),
            if seeding { "; first cycle will seed without alerting" } else { "" }
        );

        Ok(Self {
            source,
            sink,
            store,
            ctx: ScanContext {
                config,
                index,
                cycle: 0,
                seeding,
                seeded: HashSet::new(),
            },
            snapshotter,
            evaluator,
            coordinator,
            last_post: None,
        })
    }

    pub fn context(&self) -> &ScanContext {
        &self.ctx
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    fn new_report(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.ctx.cycle += 1;
        CycleReport {
            cycle: self.ctx.cycle,
            started_at: now.to_rfc3339(),
            seeding: self.ctx.seeding,
            ..Default::default()
        }
    }

    /// Run one full cycle at logical time `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut report = self.new_report(now);
        info!("Starting scan cycle {}", self.ctx.cycle);

        let deadline = tokio::time::Instant::now() + self.ctx.config.scan.cycle_timeout();

        let cutoff = now - self.ctx.config.alerts.dedup_window();
        if let Err(e) = self.store.prune_alerts(cutoff) {
            warn!("Failed to prune expired alert records: {e}");
        }
        self.replay_held(now, &mut report).await;

        let sports = self.ctx.config.scan.sports.clone();
        let listing =
            list_active_markets(&self.source, &sports, self.ctx.config.scan.call_timeout()).await;
        report.skipped_sports = listing
            .skipped_sports
            .iter()
            .map(|(sport, _)| sport.clone())
            .collect();

        if listing.total_outage(sports.len()) {
            warn!("Every sport listing failed; aborting cycle {}", self.ctx.cycle);
            report.aborted = Some("market source unavailable for every sport".to_string());
            report.finished_at = Utc::now().to_rfc3339();
            return report;
        }
        report.markets_listed = listing.markets.len();

        for (i, market) in listing.markets.iter().enumerate() {
            if self.scan_one(market, now, deadline, &mut report).await {
                let remaining = listing.markets.len() - i;
                warn!("Cycle deadline reached; deferring {remaining} market(s)");
                report.markets_deferred += remaining;
                report.aborted = Some("cycle deadline exceeded".to_string());
                break;
            }
        }

        // A partial listing cannot tell a delisted market from a failed sport.
        if report.skipped_sports.is_empty() {
            let listed: HashSet<&str> = listing.markets.iter().map(|m| m.id.as_str()).collect();
            self.prune_unlisted(&listed, &mut report);
        }

        if self.ctx.seeding && report.aborted.is_none() && report.markets_deferred == 0 {
            info!(
                "Seeded {} tracked market(s); alerts enabled from the next cycle",
                self.ctx.seeded.len()
            );
            self.ctx.seeding = false;
            self.ctx.seeded.clear();
        }

        report.leaderboard_posted = match self.post_leaderboard_if_due(now).await {
            Ok(posted) => posted,
            Err(e) => {
                warn!("Daily leaderboard not posted: {e}");
                false
            }
        };

        report.finished_at = Utc::now().to_rfc3339();
        info!(
            "Cycle {} done: {} market(s) scanned, {} event(s), {} alert(s), {} held, {} deferred",
            report.cycle,
            report.markets_scanned,
            report.events_detected,
            report.alerts_emitted,
            report.alerts_held,
            report.markets_deferred
        );
        report
    }

    /// Scan a single market outside the regular cycle (manual scans).
    pub async fn scan_market(&mut self, market: &Market, now: DateTime<Utc>) -> CycleReport {
        let mut report = self.new_report(now);
        report.markets_listed = 1;
        let deadline = tokio::time::Instant::now() + self.ctx.config.scan.cycle_timeout();
        if self.scan_one(market, now, deadline, &mut report).await {
            report.markets_deferred += 1;
            report.aborted = Some("cycle deadline exceeded".to_string());
        }
        report.finished_at = Utc::now().to_rfc3339();
        report
    }

    /// Gather then commit one market. Returns true when the deadline expired
    /// before gathering finished; nothing was committed in that case.
    async fn scan_one(
        &mut self,
        market: &Market,
        now: DateTime<Utc>,
        deadline: tokio::time::Instant,
        report: &mut CycleReport,
    ) -> bool {
        let seeding = self.ctx.seeds(&market.id);
        let gathered =
            match tokio::time::timeout_at(deadline, self.gather(market, now, seeding)).await {
                Ok(Ok(gathered)) => gathered,
                Ok(Err(e)) => {
                    warn!("Deferring \"{}\": {e}", market.title);
                    report.markets_deferred += 1;
                    return false;
                }
                Err(_) => return true,
            };

        match self.commit(gathered, now, seeding, report).await {
            Ok(()) => {
                report.markets_scanned += 1;
                if seeding {
                    self.ctx.seeded.insert(market.id.clone());
                }
            }
            Err(e) => {
                warn!("Failed to commit \"{}\": {e}", market.title);
                report.markets_deferred += 1;
            }
        }
        false
    }

    /// Network phase for one market. Has no side effects beyond the
    /// in-memory profile cache.
    async fn gather(
        &mut self,
        market: &Market,
        now: DateTime<Utc>,
        seeding: bool,
    ) -> TrackerResult<GatheredMarket> {
        let tracked = self.ctx.index.traders_in(&market.id);
        let mut snapshot = self
            .snapshotter
            .snapshot(&self.source, market, &tracked, now)
            .await?;

        let mut gathered = GatheredMarket {
            snapshot: MarketSnapshot::new(market.clone(), now),
            profiles: HashMap::new(),
            refreshed: Vec::new(),
            stale: 0,
        };
        if seeding {
            gathered.snapshot = snapshot;
            return Ok(gathered);
        }

        let min_bet = self.ctx.config.thresholds.min_bet_alert;
        for trader in candidate_traders(&self.ctx.index, &snapshot, min_bet) {
            match self.evaluator.evaluate(&self.source, &trader, now).await {
                Ok(evaluated) => {
                    match evaluated.freshness {
                        Freshness::Refreshed => gathered.refreshed.push(evaluated.profile.clone()),
                        Freshness::Stale => gathered.stale += 1,
                        Freshness::Cached => {}
                    }
                    gathered.profiles.insert(trader, evaluated.profile);
                }
                Err(e) => {
                    warn!("No profile for {trader}; re-examining next cycle: {e}");
                    snapshot.defer_trader(&trader);
                }
            }
        }
        gathered.snapshot = snapshot;
        Ok(gathered)
    }

    /// Commit phase: persist profiles, record and alert each event, then
    /// persist and install the advanced positions.
    ///
    /// The index only changes after the positions table does. A key whose
    /// event could not be recorded keeps its previous size, so the same
    /// change is detected again next cycle.
    async fn commit(
        &mut self,
        gathered: GatheredMarket,
        now: DateTime<Utc>,
        seeding: bool,
        report: &mut CycleReport,
    ) -> TrackerResult<()> {
        let GatheredMarket {
            snapshot,
            profiles,
            refreshed,
            stale,
        } = gathered;
        let market_id = snapshot.market.id.clone();

        for profile in &refreshed {
            self.store.upsert_bettor(profile)?;
        }
        report.profiles_refreshed += refreshed.len();
        report.profiles_stale += stale;

        let events = if seeding {
            Vec::new()
        } else {
            detect(
                &self.ctx.index,
                &snapshot,
                &profiles,
                self.ctx.config.thresholds.min_bet_alert,
            )
        };
        let (mut next, applied) = self.ctx.index.advance(&snapshot);
        report.events_detected += events.len();

        for event in &events {
            let profile = profiles.get(&event.trader);
            if let Err(e) = self.handle_event(event, profile, now, report).await {
                warn!(
                    "Could not record bet by {} on {} / {}; retrying next cycle: {e}",
                    event.trader, event.market_id, event.outcome
                );
                report.event_failures += 1;
                let key = PositionKey::new(event.trader.clone(), event.outcome.clone());
                match self.ctx.index.get(&market_id, &key) {
                    Some(previous) => {
                        next.insert(key, previous.clone());
                    }
                    None => {
                        next.remove(&key);
                    }
                }
            }
        }

        let positions: Vec<_> = next.values().cloned().collect();
        self.store.replace_market_positions(&market_id, &positions)?;
        self.ctx.index.install(&market_id, next);

        if snapshot.is_partial() {
            report.partial_markets += 1;
            report.traders_skipped += snapshot.skipped.len();
        }
        report.withdrawals += applied.withdrawn;
        debug!(
            "Committed {market_id}: {} updated, {} withdrawn, {} unknown kept",
            applied.updated, applied.withdrawn, applied.untouched_unknown
        );
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &BetEvent,
        profile: Option<&TraderProfile>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> TrackerResult<()> {
        info!(
            "Sharp bet: {} ${:.0} on {} in \"{}\"",
            event.trader, event.delta, event.outcome, event.market_title
        );

        let payload = match self.coordinator.consider(event, profile, &self.store, now)? {
            AlertDecision::Suppress(SuppressReason::RateLimited) => {
                self.store.insert_bet(event, AlertStatus::RateLimited)?;
                report.alerts_held += 1;
                return Ok(());
            }
            AlertDecision::Suppress(reason) => {
                debug!("Alert suppressed ({reason:?}) for {}", event.trader);
                self.store.insert_bet(event, AlertStatus::Suppressed)?;
                report.alerts_suppressed += 1;
                return Ok(());
            }
            AlertDecision::Emit(payload) => payload,
        };

        // Pending until the sink confirms.
        let bet_id = self.store.insert_bet(event, AlertStatus::Pending)?;
        self.deliver(bet_id, &payload, report).await;
        Ok(())
    }

    /// Re-offer bets held back by the hourly cap, oldest first. Stops at the
    /// first one the cap still holds; a held bet older than the dedup window
    /// is dropped as suppressed.
    async fn replay_held(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let held = match self.store.held_bets() {
            Ok(held) => held,
            Err(e) => {
                warn!("Failed to load held alerts: {e}");
                return;
            }
        };
        let cutoff = now - self.ctx.config.alerts.dedup_window();

        for bet in held {
            if bet.timestamp < cutoff {
                debug!("Held alert #{} expired", bet.id);
                self.set_status(bet.id, AlertStatus::Suppressed);
                continue;
            }
            let event = bet.to_event();
            let profile = self.evaluator.cached(&event.trader).cloned();
            match self.coordinator.consider(&event, profile.as_ref(), &self.store, now) {
                Ok(AlertDecision::Emit(payload)) => {
                    self.set_status(bet.id, AlertStatus::Pending);
                    if self.deliver(bet.id, &payload, report).await {
                        report.alerts_replayed += 1;
                    }
                }
                Ok(AlertDecision::Suppress(SuppressReason::RateLimited)) => break,
                Ok(AlertDecision::Suppress(reason)) => {
                    debug!("Held alert #{} dropped ({reason:?})", bet.id);
                    self.set_status(bet.id, AlertStatus::Suppressed);
                }
                Err(e) => {
                    warn!("Failed to replay held alert #{}: {e}", bet.id);
                    break;
                }
            }
        }
    }

    /// Post an emitted alert for ledger row `bet_id`. On failure the row is
    /// left as it is (`pending`). Returns whether the sink accepted it.
    async fn deliver(&mut self, bet_id: i64, payload: &AlertPayload, report: &mut CycleReport) -> bool {
        self.pace_posts().await;

        let limit = self.ctx.config.scan.call_timeout();
        match post_with_timeout(&self.sink, &payload.text, limit).await {
            Ok(()) => {
                let status = if self.sink.is_live() {
                    AlertStatus::Delivered
                } else {
                    AlertStatus::DryRun
                };
                self.set_status(bet_id, status);
                report.alerts_emitted += 1;
                reporter::report_alert(payload);
                true
            }
            Err(e) => {
                warn!("Alert for bet #{bet_id} not delivered, left pending: {e}");
                report.sink_failures += 1;
                false
            }
        }
    }

    fn set_status(&self, bet_id: i64, status: AlertStatus) {
        if let Err(e) = self.store.set_bet_status(bet_id, status) {
            warn!("Failed to mark bet #{bet_id} {}: {e}", status.as_str());
        }
    }

    /// Drop tracked markets the catalog no longer lists, store first.
    fn prune_unlisted(&mut self, listed: &HashSet<&str>, report: &mut CycleReport) {
        for market_id in self.ctx.index.unlisted_markets(listed) {
            match self.store.delete_market_positions(&market_id) {
                Ok(rows) => {
                    debug!("Pruned delisted market {market_id} ({rows} position(s))");
                    self.ctx.index.remove_market(&market_id);
                    report.markets_pruned += 1;
                }
                Err(e) => warn!("Failed to prune delisted market {market_id}: {e}"),
            }
        }
    }

    /// Post the sharp bettor leaderboard once per UTC day after the
    /// configured hour. Returns whether a post was made.
    pub async fn post_leaderboard_if_due(&mut self, now: DateTime<Utc>) -> TrackerResult<bool> {
        let alerts = &self.ctx.config.alerts;
        if !alerts.daily_leaderboard {
            return Ok(false);
        }
        let last_posted = self
            .store
            .get_state(LEADERBOARD_POSTED_KEY)?
            .and_then(|s| s.parse::<NaiveDate>().ok());
        if !leaderboard_due(alerts.leaderboard_hour_utc, last_posted, now) {
            return Ok(false);
        }

        let today = now.date_naive().to_string();
        let sharp = self.store.sharp_bettors()?;
        if sharp.is_empty() {
            info!("No sharp bettors yet; skipping today's leaderboard");
            self.store.set_state(LEADERBOARD_POSTED_KEY, &today)?;
            return Ok(false);
        }

        self.pace_posts().await;
        let limit = self.ctx.config.scan.call_timeout();
        post_with_timeout(&self.sink, &format_leaderboard(&sharp), limit).await?;
        self.store.set_state(LEADERBOARD_POSTED_KEY, &today)?;
        info!("Posted daily leaderboard ({} sharp bettor(s))", sharp.len());
        Ok(true)
    }

    /// Keep at least `post_interval` between consecutive posts.
    async fn pace_posts(&mut self) {
        let interval = self.ctx.config.alerts.post_interval();
        if let Some(last) = self.last_post {
            let ready_at = last + interval;
            if tokio::time::Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_post = Some(tokio::time::Instant::now());
    }
}

/// Run one cycle and print its report; used by both binaries.
pub async fn run_and_report<S: TrackerSource, K: AlertSink>(
    tracker: &mut Tracker<S, K>,
) -> Result<CycleReport> {
    let report = tracker.run_cycle(Utc::now()).await;
    reporter::report_cycle(&report);
    if let Some(reason) = &report.aborted {
        if report.markets_scanned == 0 {
            anyhow::bail!("cycle {} aborted: {reason}", report.cycle);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use crate::profile::LifetimeStats;
    use crate::types::{MarketStatus, Outcome, Position};
    use chrono::TimeZone;
    use std::cell::RefCell;

    const SHARP: &str = "0xdb27bf2ac5d428a9c63dbc914611036855a6c56e";
    const CASUAL: &str = "0x1111111111111111111111111111111111111111";

    fn lakers_market() -> Market {
        Market {
            id: "0xlakers".to_string(),
            title: "Lakers vs Celtics".to_string(),
            sport: "nba".to_string(),
            status: MarketStatus::Active,
            outcomes: vec![
                Outcome {
                    label: "Lakers to Win".to_string(),
                    price: 0.652,
                },
                Outcome {
                    label: "Celtics to Win".to_string(),
                    price: 0.348,
                },
            ],
            event_slug: "nba-lal-bos".to_string(),
        }
    }

    fn knicks_market() -> Market {
        Market {
            id: "0xknicks".to_string(),
            title: "Knicks vs Heat".to_string(),
            sport: "nba".to_string(),
            status: MarketStatus::Active,
            outcomes: vec![
                Outcome {
                    label: "Knicks to Win".to_string(),
                    price: 0.55,
                },
                Outcome {
                    label: "Heat to Win".to_string(),
                    price: 0.45,
                },
            ],
            event_slug: "nba-nyk-mia".to_string(),
        }
    }

    /// Scriptable upstream: holdings per trader, a set of unreadable traders
    /// and profile stats per wallet.
    #[derive(Default)]
    struct FakeSource {
        markets: Vec<Market>,
        markets_down: bool,
        holdings: RefCell<HashMap<String, Vec<(String, f64)>>>,
        unreadable: RefCell<HashSet<String>>,
        /// Markets whose holder list cannot be read.
        holders_down: RefCell<HashSet<String>>,
        stats: RefCell<HashMap<String, LifetimeStats>>,
        /// Wallets absent from the leaderboard.
        unranked: RefCell<HashSet<String>>,
        profile_calls: RefCell<usize>,
    }

    impl FakeSource {
        fn with_market(market: Market) -> Self {
            Self {
                markets: vec![market],
                ..Default::default()
            }
        }

        fn hold(&self, trader: &str, outcome: &str, size: f64) {
            let mut holdings = self.holdings.borrow_mut();
            let entry = holdings.entry(trader.to_string()).or_default();
            entry.retain(|(o, _)| o != outcome);
            if size > 0.0 {
                entry.push((outcome.to_string(), size));
            }
        }

        fn set_stats(&self, wallet: &str, pnl: f64, volume: f64) {
            self.stats.borrow_mut().insert(
                wallet.to_string(),
                LifetimeStats {
                    display_name: Some("DrPufferfish".to_string()),
                    pnl,
                    volume,
                    settled: 20,
                    settled_won: 12,
                },
            );
        }
    }

    impl MarketSource for FakeSource {
        async fn sport_markets(&self, sport: &str) -> TrackerResult<Vec<Market>> {
            if self.markets_down {
                return Err(TrackerError::unavailable("markets", "503"));
            }
            Ok(self
                .markets
                .iter()
                .filter(|m| m.sport == sport)
                .cloned()
                .collect())
        }
    }

    impl PositionSource for FakeSource {
        async fn holders(&self, market: &Market) -> TrackerResult<Vec<String>> {
            if self.holders_down.borrow().contains(&market.id) {
                return Err(TrackerError::unavailable("holders", "502"));
            }
            let mut wallets: Vec<String> = self
                .holdings
                .borrow()
                .iter()
                .filter(|(_, held)| !held.is_empty())
                .map(|(w, _)| w.clone())
                .collect();
            wallets.sort();
            Ok(wallets)
        }

        async fn trader_positions(
            &self,
            trader: &str,
            market: &Market,
        ) -> TrackerResult<Vec<Position>> {
            if self.unreadable.borrow().contains(trader) {
                return Err(TrackerError::unavailable("positions", "connection reset"));
            }
            Ok(self
                .holdings
                .borrow()
                .get(trader)
                .map(|held| {
                    held.iter()
                        .filter_map(|(outcome, size)| {
                            Some(Position {
                                trader: trader.to_string(),
                                market_id: market.id.clone(),
                                outcome: outcome.clone(),
                                size: *size,
                                price: market
                                    .outcomes
                                    .iter()
                                    .find(|o| &o.label == outcome)?
                                    .price,
                                observed_at: Utc::now(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    impl ProfileSource for FakeSource {
        async fn lifetime_stats(&self, wallet: &str) -> TrackerResult<LifetimeStats> {
            *self.profile_calls.borrow_mut() += 1;
            if self.unranked.borrow().contains(wallet) {
                return Ok(crate::api::no_history());
            }
            self.stats
                .borrow()
                .get(wallet)
                .cloned()
                .ok_or_else(|| TrackerError::unavailable("profile", "leaderboard timeout"))
        }
    }

    /// Sink that records every post, optionally failing.
    #[derive(Default)]
    struct RecordingSink {
        posts: RefCell<Vec<String>>,
        fail: bool,
    }

    impl AlertSink for RecordingSink {
        async fn post(&self, text: &str) -> TrackerResult<()> {
            if self.fail {
                return Err(TrackerError::SinkFailure {
                    retryable: true,
                    reason: "503".to_string(),
                });
            }
            self.posts.borrow_mut().push(text.to_string());
            Ok(())
        }
    }

    fn config(seed_on_start: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.scan.sports = vec!["nba".to_string()];
        config.scan.seed_on_start = seed_on_start;
        config.alerts.post_interval_secs = 0;
        config.alerts.daily_leaderboard = false;
        config
    }

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn tracker(
        source: FakeSource,
        sink: RecordingSink,
        seed: bool,
    ) -> Tracker<FakeSource, RecordingSink> {
        Tracker::new(config(seed), source, sink, db()).unwrap()
    }

    // ── end to end ─────────────────────────────────────────────────

    #[tokio::test]
    async fn sharp_bet_produces_exactly_one_alert() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), false);

        let first = t.run_cycle(Utc::now()).await;
        assert_eq!(first.events_detected, 0);

        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        let second = t.run_cycle(Utc::now()).await;
        assert_eq!(second.events_detected, 1);
        assert_eq!(second.alerts_emitted, 1);
        assert_eq!(second.profiles_refreshed, 1);

        let posts = t.sink.posts.borrow().clone();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("Lifetime P&L: +$127,430"));
        assert!(posts[0].contains("ROI: 23.5%"));
        assert!(posts[0].contains("Just bet $15,000 on:"));
        assert!(posts[0].contains("Lakers to Win @ $0.652"));

        let delivered = t.store().bets_with_status(AlertStatus::Delivered).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].amount, 15_000.0);
        assert_eq!(delivered[0].price, 0.652);

        // unchanged holdings on the next cycle are not a new bet
        let third = t.run_cycle(Utc::now()).await;
        assert_eq!(third.events_detected, 0);
        assert_eq!(t.sink.posts.borrow().len(), 1);
    }

    #[tokio::test]
    async fn non_sharp_trader_never_alerts() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(CASUAL, 12_000.0, 40_000.0);
        let mut t = tracker(source, RecordingSink::default(), false);
        t.source.hold(CASUAL, "Lakers to Win", 20_000.0);

        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.events_detected, 0);
        assert!(t.sink.posts.borrow().is_empty());
        let stored = t.store().get_bettor(CASUAL).unwrap().unwrap();
        assert!(!stored.is_sharp);
    }

    // ── unknown vs zero ────────────────────────────────────────────

    #[tokio::test]
    async fn unreadable_trader_keeps_previous_position() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), false);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        t.run_cycle(Utc::now()).await;

        // the trader disappears from holders and cannot be read
        t.source.hold(SHARP, "Lakers to Win", 0.0);
        t.source.unreadable.borrow_mut().insert(SHARP.to_string());
        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.withdrawals, 0);
        assert_eq!(report.partial_markets, 1);
        assert_eq!(t.store().load_positions().unwrap().len(), 1);

        // readable again with the same size: no new event
        t.source.unreadable.borrow_mut().clear();
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.events_detected, 0);
        assert_eq!(t.sink.posts.borrow().len(), 1);
    }

    #[tokio::test]
    async fn confirmed_exit_is_recorded_as_withdrawal() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), false);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        t.run_cycle(Utc::now()).await;

        t.source.hold(SHARP, "Lakers to Win", 0.0);
        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.withdrawals, 1);
        assert!(t.store().load_positions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unresolved_profile_defers_the_change() {
        let source = FakeSource::with_market(lakers_market());
        let mut t = tracker(source, RecordingSink::default(), false);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);

        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.events_detected, 0);
        assert!(t.store().load_positions().unwrap().is_empty());

        // once the profile source answers, the same bet is detected
        t.source.set_stats(SHARP, 127_430.0, 542_255.0);
        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.events_detected, 1);
        assert_eq!(report.alerts_emitted, 1);
    }

    // ── seeding and failures ───────────────────────────────────────

    #[tokio::test]
    async fn seeding_cycle_records_without_alerting() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), true);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);

        let seeded = t.run_cycle(Utc::now()).await;
        assert!(seeded.seeding);
        assert_eq!(seeded.events_detected, 0);
        assert_eq!(*t.source.profile_calls.borrow(), 0);
        assert_eq!(t.store().load_positions().unwrap().len(), 1);

        t.source.hold(SHARP, "Lakers to Win", 21_000.0);
        let next = t.run_cycle(Utc::now()).await;
        assert!(!next.seeding);
        assert_eq!(next.events_detected, 1);
        assert!(t.sink.posts.borrow()[0].contains("Just bet $6,000 on:"));
    }

    #[tokio::test]
    async fn total_market_outage_aborts_cycle() {
        let mut source = FakeSource::with_market(lakers_market());
        source.markets_down = true;
        let mut t = tracker(source, RecordingSink::default(), true);

        let report = t.run_cycle(Utc::now()).await;
        assert!(report.aborted.is_some());
        assert_eq!(report.skipped_sports, vec!["nba".to_string()]);
        assert!(t.context().seeding);
    }

    #[tokio::test]
    async fn sink_failure_leaves_bet_pending() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let mut t = tracker(source, sink, false);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);

        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.sink_failures, 1);
        assert_eq!(report.alerts_emitted, 0);
        assert_eq!(
            t.store().bets_with_status(AlertStatus::Pending).unwrap().len(),
            1
        );
        // the record was written before the sink was called
        assert_eq!(t.store().load_alerts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_resumes_from_stored_positions() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), true);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        t.run_cycle(Utc::now()).await;

        let Tracker { source, store, .. } = t;
        let mut restarted =
            Tracker::new(config(true), source, RecordingSink::default(), store).unwrap();
        assert!(!restarted.context().seeding);
        let report = restarted.run_cycle(Utc::now()).await;
        assert_eq!(report.events_detected, 0);
    }

    // ── unranked wallets ───────────────────────────────────────────

    #[tokio::test]
    async fn unranked_wallet_is_tracked_but_never_alerts() {
        let source = FakeSource::with_market(lakers_market());
        source.unranked.borrow_mut().insert(SHARP.to_string());
        let mut t = tracker(source, RecordingSink::default(), false);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);

        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.events_detected, 0);
        assert_eq!(report.traders_skipped, 0);
        assert_eq!(t.store().load_positions().unwrap().len(), 1);
        assert!(!t.store().get_bettor(SHARP).unwrap().unwrap().is_sharp);
        assert!(t.sink.posts.borrow().is_empty());
    }

    // ── commit ordering ────────────────────────────────────────────

    #[tokio::test]
    async fn failed_event_write_is_detected_again() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), false);
        t.run_cycle(Utc::now()).await;

        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        t.store().execute_batch("DROP TABLE alerts").unwrap();
        let failed = t.run_cycle(Utc::now()).await;
        assert_eq!(failed.events_detected, 1);
        assert_eq!(failed.event_failures, 1);
        assert_eq!(failed.markets_scanned, 1);
        assert!(t.sink.posts.borrow().is_empty());
        // the key was neither persisted nor advanced in memory
        assert!(t.store().load_positions().unwrap().is_empty());
        assert_eq!(t.context().index.market_count(), 0);

        t.store().initialize().unwrap();
        let retried = t.run_cycle(Utc::now()).await;
        assert_eq!(retried.events_detected, 1);
        assert_eq!(retried.alerts_emitted, 1);
        assert_eq!(t.sink.posts.borrow().len(), 1);
        assert_eq!(t.store().load_positions().unwrap().len(), 1);
    }

    // ── rate limit ─────────────────────────────────────────────────

    #[tokio::test]
    async fn rate_limited_bet_is_held_then_replayed() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut config = config(false);
        config.alerts.max_alerts_per_hour = 1;
        let mut t = Tracker::new(config, source, RecordingSink::default(), db()).unwrap();
        let now = Utc::now();
        t.run_cycle(now).await;

        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        t.source.hold(SHARP, "Celtics to Win", 8_000.0);
        let capped = t.run_cycle(now).await;
        assert_eq!(capped.events_detected, 2);
        assert_eq!(capped.alerts_emitted, 1);
        assert_eq!(capped.alerts_held, 1);
        assert_eq!(t.store().held_bets().unwrap().len(), 1);

        let later = t.run_cycle(now + chrono::Duration::hours(2)).await;
        assert_eq!(later.events_detected, 0);
        assert_eq!(later.alerts_replayed, 1);
        assert_eq!(t.sink.posts.borrow().len(), 2);
        assert!(t.store().held_bets().unwrap().is_empty());
        assert!(
            t.store()
                .bets_with_status(AlertStatus::Suppressed)
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn held_bet_past_dedup_window_is_dropped() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut config = config(false);
        config.alerts.max_alerts_per_hour = 1;
        let mut t = Tracker::new(config, source, RecordingSink::default(), db()).unwrap();
        let now = Utc::now();
        t.run_cycle(now).await;

        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        t.source.hold(SHARP, "Celtics to Win", 8_000.0);
        t.run_cycle(now).await;

        let report = t.run_cycle(now + chrono::Duration::hours(13)).await;
        assert_eq!(report.alerts_replayed, 0);
        assert_eq!(t.sink.posts.borrow().len(), 1);
        assert!(t.store().held_bets().unwrap().is_empty());
        assert_eq!(
            t.store()
                .bets_with_status(AlertStatus::Suppressed)
                .unwrap()
                .len(),
            1
        );
    }

    // ── delisted markets ───────────────────────────────────────────

    #[tokio::test]
    async fn delisted_market_is_pruned() {
        let source = FakeSource::with_market(lakers_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), false);
        t.source.hold(SHARP, "Lakers to Win", 15_000.0);
        t.run_cycle(Utc::now()).await;
        assert_eq!(t.store().load_positions().unwrap().len(), 1);

        // an outage says nothing about which markets still exist
        t.source.markets_down = true;
        let outage = t.run_cycle(Utc::now()).await;
        assert_eq!(outage.markets_pruned, 0);
        assert_eq!(t.context().index.market_count(), 1);

        t.source.markets_down = false;
        t.source.markets.clear();
        let report = t.run_cycle(Utc::now()).await;
        assert_eq!(report.markets_pruned, 1);
        assert_eq!(t.context().index.market_count(), 0);
        assert!(t.store().load_positions().unwrap().is_empty());
    }

    // ── seeding per market ─────────────────────────────────────────

    #[tokio::test]
    async fn deferred_market_is_seeded_on_its_first_commit() {
        let mut source = FakeSource::with_market(lakers_market());
        source.markets.push(knicks_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        source.holders_down.borrow_mut().insert("0xknicks".to_string());
        let mut t = tracker(source, RecordingSink::default(), true);
        t.source.hold(SHARP, "Knicks to Win", 15_000.0);

        let first = t.run_cycle(Utc::now()).await;
        assert_eq!(first.markets_deferred, 1);
        assert!(t.context().seeding);

        // the knicks holding predates the tracker; the lakers bet is new
        t.source.holders_down.borrow_mut().clear();
        t.source.hold(SHARP, "Lakers to Win", 12_000.0);
        let second = t.run_cycle(Utc::now()).await;
        assert_eq!(second.events_detected, 1);
        let posts = t.sink.posts.borrow().clone();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("Lakers to Win"));
        assert!(!t.context().seeding);
        assert_eq!(t.store().load_positions().unwrap().len(), 2);
    }

    // ── daily leaderboard ──────────────────────────────────────────

    #[tokio::test]
    async fn leaderboard_is_posted_once_per_day() {
        let source = FakeSource::with_market(lakers_market());
        let mut config = config(false);
        config.alerts.daily_leaderboard = true;
        let mut t = Tracker::new(config, source, RecordingSink::default(), db()).unwrap();
        let mut sharp = TraderProfile {
            wallet: SHARP.to_string(),
            display_name: Some("DrPufferfish".to_string()),
            pnl: 127_430.0,
            volume: 542_255.0,
            win_rate: 60.0,
            roi: 23.5,
            is_sharp: true,
            last_evaluated_at: Utc::now(),
        };
        t.store().upsert_bettor(&sharp).unwrap();
        sharp.wallet = CASUAL.to_string();
        sharp.is_sharp = false;
        t.store().upsert_bettor(&sharp).unwrap();

        let morning = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        assert!(!t.run_cycle(morning).await.leaderboard_posted);
        let noon = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        assert!(t.run_cycle(noon).await.leaderboard_posted);
        assert!(!t.run_cycle(noon + chrono::Duration::hours(3)).await.leaderboard_posted);

        let posts = t.sink.posts.borrow().clone();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("1. DrPufferfish"));
        assert!(!posts[0].contains("\n2. "));

        let next_day = Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap();
        assert!(t.run_cycle(next_day).await.leaderboard_posted);
    }

    // ── manual scan ────────────────────────────────────────────────

    #[tokio::test]
    async fn manual_scan_covers_one_market() {
        let mut source = FakeSource::with_market(lakers_market());
        source.markets.push(knicks_market());
        source.set_stats(SHARP, 127_430.0, 542_255.0);
        let mut t = tracker(source, RecordingSink::default(), false);
        t.source.hold(SHARP, "Knicks to Win", 15_000.0);
        t.source.hold(SHARP, "Lakers to Win", 9_000.0);

        let report = t.scan_market(&knicks_market(), Utc::now()).await;
        assert_eq!(report.markets_scanned, 1);
        assert_eq!(report.events_detected, 1);
        let posts = t.sink.posts.borrow().clone();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("Knicks to Win"));
        assert_eq!(t.context().index.market_count(), 1);
    }
}
