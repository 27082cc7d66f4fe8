//! Configuration
//!
//! All settings come from the environment (optionally via `.env`); everything
//! has a default so the simulator boots with no configuration at all.

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the shared SQLite file. `:memory:` gives an ephemeral store.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seed stocks, `SYM:PRICE:NAME,...`
    #[serde(default = "default_initial_stocks")]
    pub initial_stocks: String,

    #[serde(default = "default_volatility")]
    pub price_volatility_factor: f64,

    /// Percent move in a single apply that triggers a PRICE_ALERT
    #[serde(default = "default_price_alert_pct")]
    pub price_alert_pct: f64,

    /// Market hours (UTC, whole hours). Unset means always open.
    #[serde(default)]
    pub market_open_hour: Option<u32>,

    #[serde(default)]
    pub market_close_hour: Option<u32>,

    /// Per-subscriber event queue capacity
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "tickerd.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initial_stocks() -> String {
    "AAPL:150.00:Apple Inc,GOOG:2800.00:Alphabet Inc,TSLA:250.00:Tesla Inc,AMZN:3400.00:Amazon.com Inc,MSFT:300.00:Microsoft Corp".to_string()
}

fn default_volatility() -> f64 {
    0.001
}

fn default_price_alert_pct() -> f64 {
    5.0
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_webhook_max_attempts() -> u32 {
    3
}

/// One entry of the `INITIAL_STOCKS` list
#[derive(Debug, Clone, PartialEq)]
pub struct StockSeed {
    pub symbol: String,
    pub price: Decimal,
    pub name: String,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    /// Parse the `SYM:PRICE:NAME,...` seed list. Malformed entries are
    /// skipped with a warning rather than failing boot.
    pub fn stock_seeds(&self) -> Vec<StockSeed> {
        self.initial_stocks
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .filter_map(|entry| {
                let mut parts = entry.splitn(3, ':');
                let symbol = parts.next()?.trim().to_uppercase();
                let price: Decimal = match parts.next()?.trim().parse() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("skipping malformed stock seed entry: {}", entry);
                        return None;
                    }
                };
                let name = parts
                    .next()
                    .map(|n| n.trim().to_string())
                    .unwrap_or_else(|| symbol.clone());
                if symbol.is_empty() || price <= Decimal::ZERO {
                    tracing::warn!("skipping malformed stock seed entry: {}", entry);
                    return None;
                }
                Some(StockSeed {
                    symbol,
                    price,
                    name,
                })
            })
            .collect()
    }

    /// Configured market hours, if both bounds are set
    pub fn market_hours(&self) -> Option<(u32, u32)> {
        match (self.market_open_hour, self.market_close_hour) {
            (Some(open), Some(close)) if open < 24 && close < 24 => Some((open, close)),
            _ => None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            log_level: default_log_level(),
            initial_stocks: default_initial_stocks(),
            price_volatility_factor: default_volatility(),
            price_alert_pct: default_price_alert_pct(),
            market_open_hour: None,
            market_close_hour: None,
            event_queue_capacity: default_event_queue_capacity(),
            webhook_max_attempts: default_webhook_max_attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_seeds_parse() {
        let config = AppConfig::default();
        let seeds = config.stock_seeds();
        assert_eq!(seeds.len(), 5);
        assert_eq!(seeds[0].symbol, "AAPL");
        assert_eq!(seeds[0].price, dec!(150.00));
        assert_eq!(seeds[0].name, "Apple Inc");
    }

    #[test]
    fn test_malformed_seed_entries_are_skipped() {
        let config = AppConfig {
            initial_stocks: "AAPL:150:Apple,BROKEN,GOOG:abc:Alphabet,TSLA:250:Tesla".to_string(),
            ..AppConfig::default()
        };
        let seeds = config.stock_seeds();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].symbol, "AAPL");
        assert_eq!(seeds[1].symbol, "TSLA");
    }

    #[test]
    fn test_seed_without_name_falls_back_to_symbol() {
        let config = AppConfig {
            initial_stocks: "NVDA:900".to_string(),
            ..AppConfig::default()
        };
        let seeds = config.stock_seeds();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].name, "NVDA");
    }

    #[test]
    fn test_market_hours_require_both_bounds() {
        let mut config = AppConfig::default();
        assert_eq!(config.market_hours(), None);

        config.market_open_hour = Some(9);
        assert_eq!(config.market_hours(), None);

        config.market_close_hour = Some(17);
        assert_eq!(config.market_hours(), Some((9, 17)));

        config.market_close_hour = Some(25);
        assert_eq!(config.market_hours(), None);
    }
}
