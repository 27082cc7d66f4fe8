//! Stock Quote Models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Live quote state for one symbol
///
/// Invariants: `current >= 0.01`, `low <= current <= high`, `open` frozen
/// until the daily reset, `last_updated` non-decreasing.
#[derive(Debug, Clone, Serialize)]
pub struct StockQuote {
    pub symbol: String,
    pub name: String,
    pub current: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: i64,
    pub last_updated: i64,
}

impl StockQuote {
    /// Signed percent change against the daily open
    pub fn change_pct(&self) -> Decimal {
        if self.open.is_zero() {
            Decimal::ZERO
        } else {
            (self.current - self.open) / self.open * Decimal::from(100)
        }
    }
}

/// One appended price point
#[derive(Debug, Clone, Serialize)]
pub struct PricePoint {
    pub symbol: String,
    pub price: f64,
    pub ts: i64,
}

// ============================================================================
// API shapes
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeStockRequest {
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePriceRequest {
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceHistoryQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_change_pct() {
        let quote = StockQuote {
            symbol: "AAPL".to_string(),
            name: "Apple Inc".to_string(),
            current: dec!(165),
            open: dec!(150),
            high: dec!(166),
            low: dec!(149),
            volume: 1000,
            last_updated: 0,
        };
        assert_eq!(quote.change_pct(), dec!(10));
    }
}
