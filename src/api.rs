use std::collections::HashSet;

use chrono::{DateTime, Utc};
use polymarket_client_sdk::data::Client;
use polymarket_client_sdk::data::types::request::PositionsRequest;
use polymarket_client_sdk::data::types::response::Position as ApiPosition;
use polymarket_client_sdk::types::Address;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::catalog::MarketSource;
use crate::error::{TrackerError, TrackerResult};
use crate::profile::{LifetimeStats, ProfileSource};
use crate::snapshot::PositionSource;
use crate::types::{Market, MarketStatus, Outcome, Position};
use crate::{DATA_API_BASE, GAMMA_API_BASE};

/// Page size for paginated data API endpoints.
const PAGE_SIZE: i32 = 100;

/// Upper bound on settlement history pages read per trader.
const MAX_CLOSED_PAGES: usize = 20;

/// Gamma event with its nested markets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaEvent {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

/// Gamma market. `outcomes` and `outcomePrices` arrive as JSON-encoded strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub outcomes: Option<String>,
    #[serde(default)]
    pub outcome_prices: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: bool,
}

/// One entry of the data API `/holders` response (one per outcome token).
#[derive(Debug, Clone, Deserialize)]
pub struct HolderGroup {
    #[serde(default)]
    pub holders: Vec<Holder>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holder {
    #[serde(default)]
    pub proxy_wallet: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
}

/// Convert a gamma market into a catalog `Market`, if it is well formed.
pub fn parse_gamma_market(m: &GammaMarket, sport: &str, event_slug: &str) -> Option<Market> {
    if m.condition_id.is_empty() {
        return None;
    }
    let labels: Vec<String> = serde_json::from_str(m.outcomes.as_deref()?).ok()?;
    let prices: Vec<String> = m
        .outcome_prices
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    let outcomes = labels
        .into_iter()
        .enumerate()
        .map(|(i, label)| Outcome {
            label,
            price: prices
                .get(i)
                .and_then(|p| p.parse::<f64>().ok())
                .unwrap_or(0.0),
        })
        .collect();

    Some(Market {
        id: m.condition_id.clone(),
        title: m.question.clone(),
        sport: sport.to_string(),
        status: if m.active && !m.closed {
            MarketStatus::Active
        } else {
            MarketStatus::Closed
        },
        outcomes,
        event_slug: event_slug.to_string(),
    })
}

/// Wallets holding at least `min_amount` shares, deduplicated across outcomes.
///
/// Cost basis never exceeds share count (prices are below 1), so filtering
/// on shares against a USD floor never drops a qualifying holder.
pub fn holder_wallets(groups: &[HolderGroup], min_amount: f64) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut wallets = Vec::new();
    for holder in groups.iter().flat_map(|g| g.holders.iter()) {
        let Some(wallet) = holder.proxy_wallet.as_deref() else {
            continue;
        };
        if holder.amount.unwrap_or(0.0) < min_amount {
            continue;
        }
        let wallet = wallet.to_lowercase();
        if seen.insert(wallet.clone()) {
            wallets.push(wallet);
        }
    }
    wallets
}

/// Positions a trader holds in one market, above the noise floor.
///
/// Size is the cost basis (`size * avg_price`); price is the current price.
pub fn market_positions(
    positions: &[ApiPosition],
    trader: &str,
    condition_id: &str,
    noise_floor: f64,
    observed_at: DateTime<Utc>,
) -> Vec<Position> {
    positions
        .iter()
        .filter(|p| format!("{}", p.condition_id).eq_ignore_ascii_case(condition_id))
        .filter_map(|p| {
            let shares = p.size.to_f64().unwrap_or(0.0);
            let avg_price = p.avg_price.to_f64().unwrap_or(0.0);
            let cost = shares * avg_price;
            if cost < noise_floor || cost <= 0.0 {
                return None;
            }
            Some(Position {
                trader: trader.to_string(),
                market_id: condition_id.to_string(),
                outcome: p.outcome.clone(),
                size: cost,
                price: p.cur_price.to_f64().unwrap_or(0.0),
                observed_at,
            })
        })
        .collect()
}

/// Read a numeric field that may be encoded as a number or a string.
fn parse_f64(val: &Value, field: &str) -> Option<f64> {
    val.get(field).and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
    })
}

/// Pull (display name, pnl, volume) for `wallet` out of a leaderboard page.
pub fn parse_leaderboard(entries: &[Value], wallet: &str) -> Option<(Option<String>, f64, f64)> {
    let entry = entries.iter().find(|e| {
        e.get("proxyWallet")
            .and_then(|v| v.as_str())
            .is_some_and(|w| w.eq_ignore_ascii_case(wallet))
    })?;
    let name = entry
        .get("userName")
        .or_else(|| entry.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);
    let pnl = parse_f64(entry, "pnl").unwrap_or(0.0);
    let volume = parse_f64(entry, "vol").unwrap_or(0.0);
    Some((name, pnl, volume))
}

/// Stats for a wallet absent from the leaderboard: no history, never sharp.
pub fn no_history() -> LifetimeStats {
    LifetimeStats {
        display_name: None,
        pnl: 0.0,
        volume: 0.0,
        settled: 0,
        settled_won: 0,
    }
}

/// Count settled positions and how many of them closed in profit.
pub fn count_settlements(closed: &[Value]) -> (u64, u64) {
    let settled = closed.len() as u64;
    let won = closed
        .iter()
        .filter(|c| parse_f64(c, "realizedPnl").unwrap_or(0.0) > 0.0)
        .count() as u64;
    (settled, won)
}

/// Polymarket HTTP client covering markets, holders, positions and profiles.
pub struct PolymarketSource {
    http: reqwest::Client,
    data: Client,
    noise_floor: f64,
    holders_limit: u32,
}

impl PolymarketSource {
    pub fn new(
        noise_floor: f64,
        holders_limit: u32,
        call_timeout: std::time::Duration,
    ) -> TrackerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| TrackerError::unavailable("http client", e))?;
        Ok(Self {
            http,
            data: Client::default(),
            noise_floor,
            holders_limit,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        source_name: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> TrackerResult<T> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| TrackerError::unavailable(source_name, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TrackerError::unavailable(
                source_name,
                format!("HTTP {status}"),
            ));
        }
        resp.json::<T>()
            .await
            .map_err(|e| TrackerError::unavailable(source_name, e))
    }

    /// All positions of a trader, paginated.
    async fn fetch_all_positions(&self, addr: Address) -> TrackerResult<Vec<ApiPosition>> {
        let mut all = Vec::new();
        let mut offset: i32 = 0;

        loop {
            let req = PositionsRequest::builder()
                .user(addr)
                .limit(PAGE_SIZE)
                .map_err(|e| TrackerError::unavailable("positions", e))?
                .offset(offset)
                .map_err(|e| TrackerError::unavailable("positions", e))?
                .build();
            let page = self
                .data
                .positions(&req)
                .await
                .map_err(|e| TrackerError::unavailable("positions", e))?;
            let count = page.len() as i32;
            all.extend(page);

            if count < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        debug!("Fetched {} positions for {addr}", all.len());
        Ok(all)
    }
}

impl MarketSource for PolymarketSource {
    async fn sport_markets(&self, sport: &str) -> TrackerResult<Vec<Market>> {
        let url = format!("{GAMMA_API_BASE}/events");
        let events: Vec<GammaEvent> = self
            .get_json(
                "gamma",
                &url,
                &[
                    ("tag_slug", sport.to_string()),
                    ("active", "true".to_string()),
                    ("closed", "false".to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                ],
            )
            .await?;

        let markets: Vec<Market> = events
            .iter()
            .flat_map(|event| {
                event
                    .markets
                    .iter()
                    .filter_map(|m| parse_gamma_market(m, sport, &event.slug))
            })
            .collect();
        debug!("Fetched {} {sport} markets", markets.len());
        Ok(markets)
    }
}

impl PositionSource for PolymarketSource {
    async fn holders(&self, market: &Market) -> TrackerResult<Vec<String>> {
        let url = format!("{DATA_API_BASE}/holders");
        let groups: Vec<HolderGroup> = self
            .get_json(
                "holders",
                &url,
                &[
                    ("market", market.id.clone()),
                    ("limit", self.holders_limit.to_string()),
                ],
            )
            .await?;
        Ok(holder_wallets(&groups, self.noise_floor))
    }

    async fn trader_positions(&self, trader: &str, market: &Market) -> TrackerResult<Vec<Position>> {
        let addr: Address = trader
            .parse()
            .map_err(|e| TrackerError::unavailable("positions", format!("bad address {trader}: {e}")))?;
        let all = self.fetch_all_positions(addr).await?;
        Ok(market_positions(
            &all,
            trader,
            &market.id,
            self.noise_floor,
            Utc::now(),
        ))
    }
}

impl ProfileSource for PolymarketSource {
    async fn lifetime_stats(&self, wallet: &str) -> TrackerResult<LifetimeStats> {
        let url = format!("{DATA_API_BASE}/v1/leaderboard");
        let entries: Vec<Value> = self
            .get_json(
                "leaderboard",
                &url,
                &[
                    ("user", wallet.to_string()),
                    ("timePeriod", "all".to_string()),
                    ("orderBy", "PNL".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let Some((display_name, pnl, volume)) = parse_leaderboard(&entries, wallet) else {
            debug!("{wallet} has no leaderboard entry; treating as no history");
            return Ok(no_history());
        };

        let url = format!("{DATA_API_BASE}/closed-positions");
        let mut closed: Vec<Value> = Vec::new();
        for page in 0..MAX_CLOSED_PAGES {
            let batch: Vec<Value> = self
                .get_json(
                    "closed-positions",
                    &url,
                    &[
                        ("user", wallet.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                        ("offset", (page as i32 * PAGE_SIZE).to_string()),
                    ],
                )
                .await?;
            let count = batch.len() as i32;
            closed.extend(batch);
            if count < PAGE_SIZE {
                break;
            }
        }
        let (settled, settled_won) = count_settlements(&closed);

        Ok(LifetimeStats {
            display_name,
            pnl,
            volume,
            settled,
            settled_won,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    /// Build an SDK `Position` via JSON deserialization (struct is #[non_exhaustive]).
    fn make_test_position(
        condition_id: &str,
        outcome: &str,
        size: f64,
        avg_price: f64,
        cur_price: f64,
    ) -> ApiPosition {
        serde_json::from_value(json!({
            "proxyWallet": "0x0000000000000000000000000000000000000001",
            "asset": "123",
            "conditionId": condition_id,
            "size": size.to_string(),
            "avgPrice": avg_price.to_string(),
            "initialValue": (size * avg_price).to_string(),
            "currentValue": (size * cur_price).to_string(),
            "cashPnl": "0",
            "percentPnl": "0",
            "totalBought": size.to_string(),
            "realizedPnl": "0",
            "percentRealizedPnl": "0",
            "curPrice": cur_price.to_string(),
            "redeemable": false,
            "mergeable": false,
            "title": "Lakers vs Celtics",
            "slug": "lakers-celtics",
            "icon": "",
            "eventSlug": "nba-lal-bos",
            "outcome": outcome,
            "outcomeIndex": 0,
            "oppositeOutcome": "Celtics",
            "oppositeAsset": "456",
            "endDate": "2025-12-31",
            "negativeRisk": false
        }))
        .expect("valid test Position JSON")
    }

    const COND_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const COND_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    // ── gamma markets ──────────────────────────────────────────────

    #[test]
    fn gamma_event_parses_nested_markets() {
        let events: Vec<GammaEvent> = serde_json::from_value(json!([{
            "id": "1",
            "slug": "nba-lal-bos",
            "title": "Lakers vs Celtics",
            "markets": [{
                "conditionId": COND_A,
                "question": "Lakers vs. Celtics",
                "outcomes": "[\"Lakers\", \"Celtics\"]",
                "outcomePrices": "[\"0.652\", \"0.348\"]",
                "active": true,
                "closed": false
            }]
        }]))
        .unwrap();
        let market = parse_gamma_market(&events[0].markets[0], "nba", &events[0].slug).unwrap();
        assert_eq!(market.id, COND_A);
        assert_eq!(market.status, MarketStatus::Active);
        assert_eq!(market.outcomes.len(), 2);
        assert_eq!(market.outcomes[0].label, "Lakers");
        assert!(approx_eq(market.outcomes[0].price, 0.652));
        assert_eq!(market.event_slug, "nba-lal-bos");
    }

    #[test]
    fn gamma_market_without_outcomes_is_dropped() {
        let m = GammaMarket {
            condition_id: COND_A.to_string(),
            question: "?".to_string(),
            outcomes: None,
            outcome_prices: None,
            active: true,
            closed: false,
        };
        assert!(parse_gamma_market(&m, "nba", "").is_none());
    }

    #[test]
    fn gamma_closed_market_is_marked_closed() {
        let m = GammaMarket {
            condition_id: COND_A.to_string(),
            question: "?".to_string(),
            outcomes: Some("[\"Yes\",\"No\"]".to_string()),
            outcome_prices: Some("garbage".to_string()),
            active: true,
            closed: true,
        };
        let market = parse_gamma_market(&m, "nfl", "").unwrap();
        assert_eq!(market.status, MarketStatus::Closed);
        assert!(approx_eq(market.outcomes[1].price, 0.0));
    }

    // ── holders ────────────────────────────────────────────────────

    #[test]
    fn holders_filtered_and_deduplicated() {
        let groups: Vec<HolderGroup> = serde_json::from_value(json!([
            {"token": "1", "holders": [
                {"proxyWallet": "0xAAA", "amount": 5000.0, "outcomeIndex": 0},
                {"proxyWallet": "0xbbb", "amount": 10.0, "outcomeIndex": 0}
            ]},
            {"token": "2", "holders": [
                {"proxyWallet": "0xaaa", "amount": 2000.0, "outcomeIndex": 1},
                {"proxyWallet": "0xccc", "amount": 1500.0, "outcomeIndex": 1},
                {"amount": 99999.0}
            ]}
        ]))
        .unwrap();
        let wallets = holder_wallets(&groups, 1000.0);
        assert_eq!(wallets, vec!["0xaaa".to_string(), "0xccc".to_string()]);
    }

    // ── trader positions ───────────────────────────────────────────

    #[test]
    fn market_positions_keeps_only_target_market_above_floor() {
        let now = Utc::now();
        let positions = vec![
            make_test_position(COND_A, "Lakers", 23006.0, 0.652, 0.66),
            make_test_position(COND_A, "Celtics", 100.0, 0.35, 0.34),
            make_test_position(COND_B, "Yes", 50000.0, 0.5, 0.5),
        ];
        let out = market_positions(&positions, "0xt", COND_A, 1000.0, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].outcome, "Lakers");
        assert_eq!(out[0].market_id, COND_A);
        assert!((out[0].size - 23006.0 * 0.652).abs() < 1e-3);
        assert!(approx_eq(out[0].price, 0.66));
    }

    #[test]
    fn market_positions_matches_condition_case_insensitively() {
        let positions = vec![make_test_position(COND_A, "Lakers", 5000.0, 0.5, 0.5)];
        let upper = COND_A.to_uppercase().replace("0X", "0x");
        let out = market_positions(&positions, "0xt", &upper, 0.0, Utc::now());
        assert_eq!(out.len(), 1);
    }

    // ── profile data ───────────────────────────────────────────────

    #[test]
    fn leaderboard_entry_parses_strings_and_numbers() {
        let entries = vec![json!({
            "rank": "1",
            "proxyWallet": "0xABC",
            "userName": "sharpie",
            "vol": "541234.5",
            "pnl": 127430.0
        })];
        let (name, pnl, vol) = parse_leaderboard(&entries, "0xabc").unwrap();
        assert_eq!(name.as_deref(), Some("sharpie"));
        assert!(approx_eq(pnl, 127430.0));
        assert!(approx_eq(vol, 541234.5));
        assert!(parse_leaderboard(&entries, "0xdef").is_none());
    }

    #[test]
    fn source_builds_with_timeout() {
        assert!(PolymarketSource::new(1000.0, 20, std::time::Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn wallet_without_history_is_not_sharp() {
        let stats = no_history();
        let profile = crate::profile::build_profile(
            "0xdef",
            &stats,
            &crate::config::Thresholds::default(),
            Utc::now(),
        );
        assert!(!profile.is_sharp);
        assert!(approx_eq(profile.roi, 0.0));
        assert_eq!(profile.display_name, None);
    }

    #[test]
    fn settlements_count_profitable_closes() {
        let closed = vec![
            json!({"realizedPnl": 120.5}),
            json!({"realizedPnl": "-40"}),
            json!({"realizedPnl": "0"}),
            json!({"realizedPnl": "15"}),
        ];
        assert_eq!(count_settlements(&closed), (4, 2));
        assert_eq!(count_settlements(&[]), (0, 0));
    }
}
