use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Thresholds;
use crate::error::{TrackerError, TrackerResult, with_timeout};
use crate::types::TraderProfile;

/// Raw lifetime figures for one wallet as reported by the profile source.
#[derive(Debug, Clone, PartialEq)]
pub struct LifetimeStats {
    pub display_name: Option<String>,
    pub pnl: f64,
    pub volume: f64,
    /// Number of settled positions.
    pub settled: u64,
    /// Settled positions that closed in profit.
    pub settled_won: u64,
}

/// Upstream profit/loss and settlement history per wallet.
pub trait ProfileSource {
    async fn lifetime_stats(&self, wallet: &str) -> TrackerResult<LifetimeStats>;
}

/// Sharp iff profit, ROI and volume each clear their minimum.
pub fn classify(thresholds: &Thresholds, pnl: f64, roi: f64, volume: f64) -> bool {
    pnl >= thresholds.min_pnl && roi >= thresholds.min_roi && volume >= thresholds.min_volume
}

/// Derive a profile (win rate, ROI, sharp flag) from raw stats.
pub fn build_profile(
    wallet: &str,
    stats: &LifetimeStats,
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> TraderProfile {
    let win_rate = if stats.settled > 0 {
        stats.settled_won as f64 / stats.settled as f64 * 100.0
    } else {
        0.0
    };
    let roi = if stats.volume > 0.0 {
        stats.pnl / stats.volume * 100.0
    } else {
        0.0
    };
    TraderProfile {
        wallet: wallet.to_string(),
        display_name: stats.display_name.clone(),
        pnl: stats.pnl,
        volume: stats.volume,
        win_rate,
        roi,
        is_sharp: classify(thresholds, stats.pnl, roi, stats.volume),
        last_evaluated_at: now,
    }
}

/// How an evaluation was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within TTL; no upstream call was made.
    Cached,
    /// Recomputed from the source this call.
    Refreshed,
    /// TTL expired and the refresh failed; last known value returned.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Evaluated {
    pub profile: TraderProfile,
    pub freshness: Freshness,
}

/// Lazily refreshed cache of trader profiles.
pub struct ProfileEvaluator {
    thresholds: Thresholds,
    ttl: chrono::Duration,
    call_timeout: Duration,
    cache: HashMap<String, TraderProfile>,
}

impl ProfileEvaluator {
    /// Build an evaluator seeded with previously stored profiles.
    ///
    /// Stored sharp flags are recomputed against the current thresholds.
    pub fn new(
        thresholds: Thresholds,
        ttl: chrono::Duration,
        call_timeout: Duration,
        stored: Vec<TraderProfile>,
    ) -> Self {
        let cache = stored
            .into_iter()
            .map(|mut p| {
                p.is_sharp = classify(&thresholds, p.pnl, p.roi, p.volume);
                (p.wallet.clone(), p)
            })
            .collect();
        Self {
            thresholds,
            ttl,
            call_timeout,
            cache,
        }
    }

    pub fn cached(&self, wallet: &str) -> Option<&TraderProfile> {
        self.cache.get(wallet)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    fn is_fresh(&self, profile: &TraderProfile, now: DateTime<Utc>) -> bool {
        now - profile.last_evaluated_at < self.ttl
    }

    /// Return a profile for `wallet`, refreshing it from `source` if stale.
    ///
    /// A failed refresh degrades to the last known profile. Only a wallet
    /// that has never been evaluated yields an error.
    pub async fn evaluate<S: ProfileSource>(
        &mut self,
        source: &S,
        wallet: &str,
        now: DateTime<Utc>,
    ) -> TrackerResult<Evaluated> {
        if let Some(profile) = self.cache.get(wallet) {
            if self.is_fresh(profile, now) {
                return Ok(Evaluated {
                    profile: profile.clone(),
                    freshness: Freshness::Cached,
                });
            }
        }

        match with_timeout("profile", self.call_timeout, source.lifetime_stats(wallet)).await {
            Ok(stats) => {
                let profile = build_profile(wallet, &stats, &self.thresholds, now);
                info!(
                    "Updated profile for {wallet}: P&L=${:.0}, ROI={:.1}%, sharp={}",
                    profile.pnl, profile.roi, profile.is_sharp
                );
                self.cache.insert(wallet.to_string(), profile.clone());
                Ok(Evaluated {
                    profile,
                    freshness: Freshness::Refreshed,
                })
            }
            Err(e) => match self.cache.get(wallet) {
                Some(last) => {
                    let stale = TrackerError::ClassificationStale {
                        wallet: wallet.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{stale}; using profile from {}", last.last_evaluated_at);
                    Ok(Evaluated {
                        profile: last.clone(),
                        freshness: Freshness::Stale,
                    })
                }
                None => {
                    debug!("No profile available for {wallet}: {e}");
                    Err(e)
                }
            },
        }
    }
}
