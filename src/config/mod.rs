//! Configuration management for the grid hedger.
//!
//! Loads settings from environment variables and config files. Credentials are
//! resolved through a typed `(venue, subaccount)` lookup populated once at
//! startup rather than ad hoc environment variable name construction.

use crate::exchange::Venue;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API credentials per subaccount
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
    /// Instrument stream definitions
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Reconciliation schedule parameters
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Delta-hedge loop parameters
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Path to the SQLite document store
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

/// One credential record as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub venue: Venue,
    pub subaccount: String,
    pub api_key: String,
    pub secret_key: String,
}

/// API credentials for signing venue requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret_key: String,
}

/// Typed credential lookup keyed by `(venue, subaccount)`.
///
/// Built once at startup; a missing entry is a configuration error surfaced
/// before any connection is opened.
#[derive(Debug, Clone, Default)]
pub struct CredentialBook {
    entries: HashMap<(Venue, String), ApiCredentials>,
}

impl CredentialBook {
    /// Build the book from config entries.
    pub fn from_entries(entries: &[CredentialEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|e| {
                (
                    (e.venue, e.subaccount.clone()),
                    ApiCredentials {
                        api_key: e.api_key.clone(),
                        secret_key: e.secret_key.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Look up credentials for a venue/subaccount pair.
    pub fn get(&self, venue: Venue, subaccount: &str) -> Option<&ApiCredentials> {
        self.entries.get(&(venue, subaccount.to_string()))
    }

    /// Look up credentials, failing with a descriptive error when absent.
    pub fn require(&self, venue: Venue, subaccount: &str) -> Result<&ApiCredentials> {
        self.get(venue, subaccount).with_context(|| {
            format!("No credentials configured for {} subaccount '{}'", venue, subaccount)
        })
    }
}

/// Definition of one monitored instrument stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub venue: Venue,
    pub subaccount: String,
    /// One symbol, or two for ratio pricing (price = first / second)
    pub symbols: Vec<String>,
    /// Feed kind: mark price, last trade, or depth
    #[serde(default)]
    pub feed: FeedKind,
    /// Ascending grid levels; empty means the grid is loaded lazily at open
    #[serde(default)]
    pub grid: Vec<Decimal>,
    /// Emit observable price-update events
    #[serde(default)]
    pub announce_prices: bool,
    /// Per-connection staleness timeout in seconds
    #[serde(default = "default_control_time_secs")]
    pub control_time_secs: u64,
    /// Duplicate-trade cache bound (0 disables duplicate-order protection)
    #[serde(default = "default_cache_limit")]
    pub cache_limit: usize,
}

/// Market data feed kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    #[default]
    Mark,
    Last,
    Depth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum submission attempts per order
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Receive window passed to the venue, also the settle delay after a
    /// failed attempt
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between reconciliation sweeps
    #[serde(default = "default_recon_interval_secs")]
    pub interval_secs: u64,
    /// History page window in days (venue returns at most this span per call)
    #[serde(default = "default_page_window_days")]
    pub page_window_days: i64,
    /// Two records with the same client order id within this window are
    /// collapsed as a retry race
    #[serde(default = "default_near_duplicate_ms")]
    pub near_duplicate_ms: i64,
    /// Records newer than this are double-checked against the live trades
    /// endpoint
    #[serde(default = "default_recent_trades_mins")]
    pub recent_trades_mins: i64,
    /// How far back the first run for a subaccount seeds its checkpoint
    #[serde(default = "default_start_days_back")]
    pub start_days_back: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Consecutive favorable observations required before the hedge fires
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: u32,
    /// Required margin between the two legs, in percent
    #[serde(default = "default_profit_percent")]
    pub profit_percent: Decimal,
    /// Multiplier sizing the secondary leg relative to the primary
    #[serde(default = "default_hedge_factor")]
    pub hedge_factor: Decimal,
    /// Contract-multiplier normalization divisor for the secondary leg
    #[serde(default = "default_price_normalization")]
    pub price_normalization: Decimal,
    /// Seconds between status reports while validating
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

// Default value functions

fn default_store_path() -> String {
    "data/grid_hedger.db".to_string()
}

fn default_control_time_secs() -> u64 {
    30
}

fn default_cache_limit() -> usize {
    100
}

fn default_max_retries() -> u32 {
    5
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_recon_interval_secs() -> u64 {
    300
}

fn default_page_window_days() -> i64 {
    7
}

fn default_near_duplicate_ms() -> i64 {
    5000
}

fn default_recent_trades_mins() -> i64 {
    30
}

fn default_start_days_back() -> i64 {
    30
}

fn default_validation_threshold() -> u32 {
    5
}

fn default_profit_percent() -> Decimal {
    Decimal::new(3, 1) // 0.3%
}

fn default_hedge_factor() -> Decimal {
    Decimal::ONE
}

fn default_price_normalization() -> Decimal {
    Decimal::ONE
}

fn default_status_interval_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("GH"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.execution.max_retries >= 1,
            "max_retries must be at least 1"
        );

        anyhow::ensure!(
            self.hedge.validation_threshold >= 1,
            "validation_threshold must be at least 1"
        );

        anyhow::ensure!(
            self.hedge.price_normalization > Decimal::ZERO,
            "price_normalization must be positive"
        );

        anyhow::ensure!(
            self.reconciliation.page_window_days >= 1,
            "page_window_days must be at least 1"
        );

        for stream in &self.streams {
            anyhow::ensure!(
                !stream.symbols.is_empty() && stream.symbols.len() <= 2,
                "stream must track one or two symbols, got {}",
                stream.symbols.len()
            );

            anyhow::ensure!(
                stream.grid.windows(2).all(|w| w[0] < w[1]),
                "grid levels for {:?} must be strictly ascending",
                stream.symbols
            );
        }

        Ok(())
    }

    /// Build the typed credential book from the configured entries.
    pub fn credential_book(&self) -> CredentialBook {
        CredentialBook::from_entries(&self.credentials)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            streams: Vec::new(),
            execution: ExecutionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            hedge: HedgeConfig::default(),
            store_path: default_store_path(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            recv_window_ms: default_recv_window_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recon_interval_secs(),
            page_window_days: default_page_window_days(),
            near_duplicate_ms: default_near_duplicate_ms(),
            recent_trades_mins: default_recent_trades_mins(),
            start_days_back: default_start_days_back(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            validation_threshold: default_validation_threshold(),
            profit_percent: default_profit_percent(),
            hedge_factor: default_hedge_factor(),
            price_normalization: default_price_normalization(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_descending_grid_rejected() {
        let mut config = Config::default();
        config.streams.push(StreamConfig {
            venue: Venue::BinanceFutures,
            subaccount: "main".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
            feed: FeedKind::Mark,
            grid: vec![dec!(100), dec!(95)],
            announce_prices: false,
            control_time_secs: 30,
            cache_limit: 100,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credential_book_lookup() {
        let book = CredentialBook::from_entries(&[CredentialEntry {
            venue: Venue::BinanceFutures,
            subaccount: "alpha".to_string(),
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
        }]);

        assert!(book.get(Venue::BinanceFutures, "alpha").is_some());
        assert!(book.get(Venue::BinanceSpot, "alpha").is_none());
        assert!(book.require(Venue::BinanceFutures, "missing").is_err());
    }
}
