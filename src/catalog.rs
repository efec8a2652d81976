use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{TrackerError, TrackerResult, with_timeout};
use crate::types::{Market, MarketStatus};

/// Upstream listing of markets per sport tag.
pub trait MarketSource {
    async fn sport_markets(&self, sport: &str) -> TrackerResult<Vec<Market>>;
}

/// Result of resolving the active market set for one cycle.
#[derive(Debug, Default)]
pub struct CatalogListing {
    pub markets: Vec<Market>,
    /// Sports whose listing failed; they are skipped for this cycle.
    pub skipped_sports: Vec<(String, TrackerError)>,
}

impl CatalogListing {
    /// True when every requested sport failed.
    pub fn total_outage(&self, requested: usize) -> bool {
        requested > 0 && self.skipped_sports.len() == requested
    }
}

/// Resolve markets open for betting in the given sports.
///
/// A failing sport is reported in `skipped_sports` and never aborts the rest.
/// Markets listed under several tags are returned once, keeping the first
/// sport they were seen under.
pub async fn list_active_markets<S: MarketSource>(
    source: &S,
    sports: &[String],
    call_timeout: Duration,
) -> CatalogListing {
    let mut listing = CatalogListing::default();
    let mut seen = HashSet::new();

    for sport in sports {
        let result = with_timeout("markets", call_timeout, source.sport_markets(sport)).await;
        let markets = match result {
            Ok(markets) => markets,
            Err(e) => {
                warn!("Skipping {sport} this cycle: {e}");
                listing.skipped_sports.push((sport.clone(), e));
                continue;
            }
        };

        let before = listing.markets.len();
        for market in markets {
            if market.status != MarketStatus::Active || market.outcomes.len() < 2 {
                continue;
            }
            if seen.insert(market.id.clone()) {
                listing.markets.push(market);
            }
        }
        debug!("{sport}: {} active market(s)", listing.markets.len() - before);
    }

    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;
    use std::collections::HashMap;

    struct FakeMarketSource {
        by_sport: HashMap<String, TrackerResult<Vec<Market>>>,
    }

    impl MarketSource for FakeMarketSource {
        async fn sport_markets(&self, sport: &str) -> TrackerResult<Vec<Market>> {
            match self.by_sport.get(sport) {
                Some(Ok(markets)) => Ok(markets.clone()),
                Some(Err(_)) | None => Err(TrackerError::unavailable("gamma", "down")),
            }
        }
    }

    fn market(id: &str, sport: &str, status: MarketStatus, n_outcomes: usize) -> Market {
        Market {
            id: id.to_string(),
            title: format!("market {id}"),
            sport: sport.to_string(),
            status,
            outcomes: (0..n_outcomes)
                .map(|i| Outcome {
                    label: format!("o{i}"),
                    price: 0.5,
                })
                .collect(),
            event_slug: String::new(),
        }
    }

    fn sports(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn filters_closed_and_degenerate_markets() {
        let source = FakeMarketSource {
            by_sport: HashMap::from([(
                "nba".to_string(),
                Ok(vec![
                    market("m1", "nba", MarketStatus::Active, 2),
                    market("m2", "nba", MarketStatus::Closed, 2),
                    market("m3", "nba", MarketStatus::Active, 1),
                ]),
            )]),
        };
        let listing =
            list_active_markets(&source, &sports(&["nba"]), Duration::from_secs(1)).await;
        assert_eq!(listing.markets.len(), 1);
        assert_eq!(listing.markets[0].id, "m1");
        assert!(listing.skipped_sports.is_empty());
    }

    #[tokio::test]
    async fn failing_sport_is_skipped_not_fatal() {
        let source = FakeMarketSource {
            by_sport: HashMap::from([
                (
                    "nba".to_string(),
                    Ok(vec![market("m1", "nba", MarketStatus::Active, 2)]),
                ),
                (
                    "nfl".to_string(),
                    Err(TrackerError::unavailable("gamma", "down")),
                ),
            ]),
        };
        let listing =
            list_active_markets(&source, &sports(&["nfl", "nba"]), Duration::from_secs(1)).await;
        assert_eq!(listing.markets.len(), 1);
        assert_eq!(listing.skipped_sports.len(), 1);
        assert_eq!(listing.skipped_sports[0].0, "nfl");
        assert!(matches!(
            listing.skipped_sports[0].1,
            TrackerError::SourceUnavailable { .. }
        ));
        assert!(!listing.total_outage(2));
    }

    #[tokio::test]
    async fn duplicate_markets_across_tags_listed_once() {
        let source = FakeMarketSource {
            by_sport: HashMap::from([
                (
                    "nba".to_string(),
                    Ok(vec![market("m1", "nba", MarketStatus::Active, 2)]),
                ),
                (
                    "ncaa-basketball".to_string(),
                    Ok(vec![
                        market("m1", "ncaa-basketball", MarketStatus::Active, 2),
                        market("m2", "ncaa-basketball", MarketStatus::Active, 3),
                    ]),
                ),
            ]),
        };
        let listing = list_active_markets(
            &source,
            &sports(&["nba", "ncaa-basketball"]),
            Duration::from_secs(1),
        )
        .await;
        let ids: Vec<&str> = listing.markets.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(listing.markets[0].sport, "nba");
    }

    #[tokio::test]
    async fn all_sports_failing_is_total_outage() {
        let source = FakeMarketSource {
            by_sport: HashMap::new(),
        };
        let listing =
            list_active_markets(&source, &sports(&["nba", "nfl"]), Duration::from_secs(1)).await;
        assert!(listing.markets.is_empty());
        assert!(listing.total_outage(2));
    }
}
