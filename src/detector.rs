use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::types::{BetEvent, MarketSnapshot, Position, PositionKey, PositionRead, TraderProfile};

/// Last known position per key, grouped by market.
///
/// This is the "previous snapshot" every cycle is diffed against.
#[derive(Debug, Clone, Default)]
pub struct PositionIndex {
    markets: HashMap<String, HashMap<PositionKey, Position>>,
}

/// Changes made to the index by one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub updated: usize,
    pub withdrawn: usize,
    pub untouched_unknown: usize,
}

impl PositionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index from persisted positions.
    pub fn from_positions(positions: Vec<Position>) -> Self {
        let mut index = Self::new();
        for pos in positions {
            index
                .markets
                .entry(pos.market_id.clone())
                .or_default()
                .insert(pos.key(), pos);
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.markets.values().all(|m| m.is_empty())
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn market(&self, market_id: &str) -> Option<&HashMap<PositionKey, Position>> {
        self.markets.get(market_id)
    }

    pub fn get(&self, market_id: &str, key: &PositionKey) -> Option<&Position> {
        self.markets.get(market_id).and_then(|m| m.get(key))
    }

    /// Traders with a known position in `market_id`, sorted.
    pub fn traders_in(&self, market_id: &str) -> Vec<String> {
        self.markets
            .get(market_id)
            .map(|m| {
                m.keys()
                    .map(|k| k.trader.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Advance the previous state with `snapshot`, in place.
    #[cfg(test)]
    pub fn apply(&mut self, snapshot: &MarketSnapshot) -> ApplyStats {
        let (next, stats) = self.advance(snapshot);
        self.install(&snapshot.market.id, next);
        stats
    }

    /// Compute the next state of one market without touching the index.
    ///
    /// Observed keys overwrite, keys confirmed at zero are removed, and keys
    /// of unreadable traders are left exactly as they were.
    pub fn advance(&self, snapshot: &MarketSnapshot) -> (HashMap<PositionKey, Position>, ApplyStats) {
        let mut stats = ApplyStats::default();
        let mut market = self
            .markets
            .get(&snapshot.market.id)
            .cloned()
            .unwrap_or_default();

        market.retain(|key, _| match snapshot.read(key) {
            PositionRead::Observed(_) => true,
            PositionRead::ConfirmedZero => {
                debug!(
                    "{} exited {} in {}",
                    key.trader, key.outcome, snapshot.market.id
                );
                stats.withdrawn += 1;
                false
            }
            PositionRead::Unknown => {
                stats.untouched_unknown += 1;
                true
            }
        });

        for (key, pos) in &snapshot.positions {
            market.insert(key.clone(), pos.clone());
            stats.updated += 1;
        }
        (market, stats)
    }

    /// Replace the state of one market; an empty state drops the market.
    pub fn install(&mut self, market_id: &str, positions: HashMap<PositionKey, Position>) {
        if positions.is_empty() {
            self.markets.remove(market_id);
        } else {
            self.markets.insert(market_id.to_string(), positions);
        }
    }

    /// Ids of tracked markets not in `listed`, sorted.
    pub fn unlisted_markets(&self, listed: &HashSet<&str>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .markets
            .keys()
            .filter(|id| !listed.contains(id.as_str()))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn remove_market(&mut self, market_id: &str) {
        self.markets.remove(market_id);
    }
}

/// Size increase of an observed key relative to the previous state.
fn delta(previous: Option<&HashMap<PositionKey, Position>>, current: &Position) -> f64 {
    let prior = previous
        .and_then(|m| m.get(&current.key()))
        .map(|p| p.size)
        .unwrap_or(0.0);
    current.size - prior
}

fn qualifies(delta: f64, min_bet_alert: f64) -> bool {
    delta > 0.0 && delta >= min_bet_alert
}

/// Traders with at least one key whose increase clears `min_bet_alert`.
///
/// Only these need a profile before detection, sparing profile lookups for
/// traders whose holdings did not move.
pub fn candidate_traders(
    previous: &PositionIndex,
    current: &MarketSnapshot,
    min_bet_alert: f64,
) -> Vec<String> {
    let prev = previous.market(&current.market.id);
    current
        .positions
        .values()
        .filter(|pos| qualifies(delta(prev, pos), min_bet_alert))
        .map(|pos| pos.trader.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Surface new bets in `current` relative to `previous`.
///
/// A key yields an event iff its size grew by at least `min_bet_alert` and
/// its trader's profile is sharp. Keys absent from `current` are never
/// interpreted here. Events are ordered by trader then outcome.
pub fn detect(
    previous: &PositionIndex,
    current: &MarketSnapshot,
    profiles: &HashMap<String, TraderProfile>,
    min_bet_alert: f64,
) -> Vec<BetEvent> {
    let prev = previous.market(&current.market.id);
    let mut events: Vec<BetEvent> = current
        .positions
        .values()
        .filter_map(|pos| {
            let delta = delta(prev, pos);
            if !qualifies(delta, min_bet_alert) {
                return None;
            }
            let sharp = profiles.get(&pos.trader).is_some_and(|p| p.is_sharp);
            if !sharp {
                return None;
            }
            Some(BetEvent {
                trader: pos.trader.clone(),
                market_id: current.market.id.clone(),
                market_title: current.market.title.clone(),
                sport: current.market.sport.clone(),
                outcome: pos.outcome.clone(),
                delta,
                cumulative_size: pos.size,
                price: pos.price,
                detected_at: current.taken_at,
            })
        })
        .collect();
    events.sort_by(|a, b| (&a.trader, &a.outcome).cmp(&(&b.trader, &b.outcome)));
    events
}
