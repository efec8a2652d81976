use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, warn};

use crate::error::{TrackerError, TrackerResult, with_timeout};
use crate::types::{Market, MarketSnapshot, Position};

/// Upstream access to market holders and per-trader holdings.
pub trait PositionSource {
    /// Wallets currently holding a meaningful stake in `market`.
    async fn holders(&self, market: &Market) -> TrackerResult<Vec<String>>;

    /// Everything `trader` holds in `market` above the noise floor.
    ///
    /// `Ok(vec![])` means the trader was read and holds nothing; an error
    /// means the holdings are unknown.
    async fn trader_positions(&self, trader: &str, market: &Market) -> TrackerResult<Vec<Position>>;
}

/// Takes per-market position snapshots that tolerate partial failures.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    pub noise_floor: f64,
    pub call_timeout: Duration,
    pub concurrency: usize,
}

impl Snapshotter {
    pub fn new(noise_floor: f64, call_timeout: Duration, concurrency: usize) -> Self {
        Self {
            noise_floor,
            call_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Snapshot `market`, reading the current holders plus every `tracked`
    /// trader so that exits can be confirmed rather than guessed.
    ///
    /// Fails with `SourceUnavailable` only when the holder list itself cannot
    /// be read. Individual trader failures land in `skipped`.
    pub async fn snapshot<S: PositionSource>(
        &self,
        source: &S,
        market: &Market,
        tracked: &[String],
        now: DateTime<Utc>,
    ) -> TrackerResult<MarketSnapshot> {
        let holders = with_timeout("holders", self.call_timeout, source.holders(market)).await?;

        let mut seen = HashSet::new();
        let candidates: Vec<String> = holders
            .into_iter()
            .chain(tracked.iter().cloned())
            .map(|w| w.to_lowercase())
            .filter(|w| seen.insert(w.clone()))
            .collect();

        let call_timeout = self.call_timeout;
        let reads: Vec<(String, TrackerResult<Vec<Position>>)> = stream::iter(candidates)
            .map(|trader| async move {
                let result = with_timeout(
                    "positions",
                    call_timeout,
                    source.trader_positions(&trader, market),
                )
                .await;
                (trader, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut snap = MarketSnapshot::new(market.clone(), now);
        for (trader, result) in reads {
            match result {
                Ok(positions) => {
                    for pos in positions {
                        if pos.size < self.noise_floor || pos.size <= 0.0 {
                            continue;
                        }
                        snap.positions.insert(pos.key(), pos);
                    }
                    snap.rescanned.insert(trader);
                }
                Err(e) => {
                    debug!("Could not read {trader} in {}: {e}", market.id);
                    snap.skipped.push(trader);
                }
            }
        }

        if snap.is_partial() {
            let err = TrackerError::PartialRead {
                market_id: market.id.clone(),
                skipped: snap.skipped.len(),
            };
            warn!("{err} (\"{}\")", market.title);
        }
        debug!(
            "Snapshot {}: {} position(s), {} trader(s) read, {} skipped",
            market.id,
            snap.positions.len(),
            snap.rescanned.len(),
            snap.skipped.len()
        );
        Ok(snap)
    }
}
