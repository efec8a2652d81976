pub mod alerts;
pub mod api;
pub mod catalog;
pub mod config;
pub mod detector;
pub mod error;
pub mod profile;
pub mod reporter;
pub mod scanner;
pub mod sink;
pub mod snapshot;
pub mod store;
pub mod types;

/// Polymarket data API base URL (public, no auth required)
pub const DATA_API_BASE: &str = "https://data-api.polymarket.com";

/// Gamma API base URL (events, markets and sport tags)
pub const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

/// Public site, used for market links in CLI output
pub const POLYMARKET_BASE_URL: &str = "https://polymarket.com";
