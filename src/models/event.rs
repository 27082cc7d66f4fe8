//! Event Model
//!
//! Typed events carried by the bus and delivered to streaming subscribers
//! and webhooks. Kinds are a closed, case-sensitive set.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use super::order::{Execution, Order, Side};

/// Subscribable event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    OrderPlaced,
    OrderExecuted,
    OrderCanceled,
    PriceUpdate,
    PriceAlert,
    BalanceUpdated,
    NewTransaction,
    TopStocksUpdated,
    PredictionAvailable,
}

impl EventKind {
    /// Every subscribable kind, in declaration order
    pub const ALL: [EventKind; 9] = [
        EventKind::OrderPlaced,
        EventKind::OrderExecuted,
        EventKind::OrderCanceled,
        EventKind::PriceUpdate,
        EventKind::PriceAlert,
        EventKind::BalanceUpdated,
        EventKind::NewTransaction,
        EventKind::TopStocksUpdated,
        EventKind::PredictionAvailable,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::OrderPlaced => "ORDER_PLACED",
            EventKind::OrderExecuted => "ORDER_EXECUTED",
            EventKind::OrderCanceled => "ORDER_CANCELED",
            EventKind::PriceUpdate => "PRICE_UPDATE",
            EventKind::PriceAlert => "PRICE_ALERT",
            EventKind::BalanceUpdated => "BALANCE_UPDATED",
            EventKind::NewTransaction => "NEW_TRANSACTION",
            EventKind::TopStocksUpdated => "TOP_STOCKS_UPDATED",
            EventKind::PredictionAvailable => "PREDICTION_AVAILABLE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Case-sensitive on purpose
        match s {
            "ORDER_PLACED" => Ok(EventKind::OrderPlaced),
            "ORDER_EXECUTED" => Ok(EventKind::OrderExecuted),
            "ORDER_CANCELED" => Ok(EventKind::OrderCanceled),
            "PRICE_UPDATE" => Ok(EventKind::PriceUpdate),
            "PRICE_ALERT" => Ok(EventKind::PriceAlert),
            "BALANCE_UPDATED" => Ok(EventKind::BalanceUpdated),
            "NEW_TRANSACTION" => Ok(EventKind::NewTransaction),
            "TOP_STOCKS_UPDATED" => Ok(EventKind::TopStocksUpdated),
            "PREDICTION_AVAILABLE" => Ok(EventKind::PredictionAvailable),
            _ => Err(format!("unknown event kind: {}", s)),
        }
    }
}

/// Price tick events (`PRICE_UPDATE`, `PRICE_ALERT`)
#[derive(Debug, Clone, Serialize)]
pub struct PriceEvent {
    pub kind: EventKind,
    pub symbol: String,
    pub price: Decimal,
    pub change_pct: Decimal,
    pub ts: i64,
}

/// Order lifecycle events (`ORDER_PLACED`, `ORDER_EXECUTED`, `ORDER_CANCELED`)
#[derive(Debug, Clone, Serialize)]
pub struct MarketEvent {
    pub kind: EventKind,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: Decimal,
    pub investor: Uuid,
    pub ts: i64,
}

impl MarketEvent {
    pub fn placed(order: &Order) -> Self {
        Self {
            kind: EventKind::OrderPlaced,
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            price: order.limit_price,
            investor: order.investor,
            ts: order.created_at,
        }
    }

    pub fn canceled(order: &Order) -> Self {
        Self {
            kind: EventKind::OrderCanceled,
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.remaining(),
            price: order.limit_price,
            investor: order.investor,
            ts: order.updated_at,
        }
    }

    /// One `ORDER_EXECUTED` per counterparty
    pub fn executed(execution: &Execution, side: Side) -> Self {
        let (order_id, investor) = match side {
            Side::Buy => (execution.buy_order_id, execution.buyer),
            Side::Sell => (execution.sell_order_id, execution.seller),
        };
        Self {
            kind: EventKind::OrderExecuted,
            order_id,
            symbol: execution.symbol.clone(),
            side,
            qty: execution.qty,
            price: execution.price,
            investor,
            ts: execution.ts,
        }
    }
}

/// Portfolio-side events (`BALANCE_UPDATED`, `NEW_TRANSACTION`)
#[derive(Debug, Clone, Serialize)]
pub struct AccountEvent {
    pub kind: EventKind,
    pub investor: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub amount: Decimal,
    pub ts: i64,
}

/// Analytics-side events (`TOP_STOCKS_UPDATED`, `PREDICTION_AVAILABLE`)
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub detail: serde_json::Value,
    pub ts: i64,
}

/// Externally injected event (the manual publish surface), carrying an
/// arbitrary payload under one of the closed kinds
#[derive(Debug, Clone, Serialize)]
pub struct CustomEvent {
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub ts: i64,
}

/// Internal notice published when one leg of a settlement could not apply.
/// Not part of the subscribable kind set; delivered to wildcard subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementFailedNotice {
    pub kind: &'static str,
    pub execution_id: Uuid,
    pub symbol: String,
    pub reason: String,
    pub ts: i64,
}

impl SettlementFailedNotice {
    pub fn new(execution_id: Uuid, symbol: String, reason: String, ts: i64) -> Self {
        Self {
            kind: "SETTLEMENT_FAILED",
            execution_id,
            symbol,
            reason,
            ts,
        }
    }
}

/// Terminal notice injected when a subscriber's queue overflowed
#[derive(Debug, Clone, Serialize)]
pub struct OverflowNotice {
    pub kind: &'static str,
    pub dropped: bool,
}

impl Default for OverflowNotice {
    fn default() -> Self {
        Self {
            kind: "OVERFLOW",
            dropped: true,
        }
    }
}

/// Any event carried by the bus
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    Price(PriceEvent),
    Market(MarketEvent),
    Account(AccountEvent),
    Analytics(AnalyticsEvent),
    Custom(CustomEvent),
    SettlementFailed(SettlementFailedNotice),
    Overflow(OverflowNotice),
}

impl Event {
    /// Subscribable kind, if any (internal notices have none)
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Event::Price(e) => Some(e.kind),
            Event::Market(e) => Some(e.kind),
            Event::Account(e) => Some(e.kind),
            Event::Analytics(e) => Some(e.kind),
            Event::Custom(e) => Some(e.kind),
            Event::SettlementFailed(_) | Event::Overflow(_) => None,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Event::Price(e) => Some(&e.symbol),
            Event::Market(e) => Some(&e.symbol),
            Event::Account(e) => e.symbol.as_deref(),
            Event::Analytics(e) => e.symbol.as_deref(),
            Event::Custom(e) => e.data.get("symbol").and_then(|s| s.as_str()),
            Event::SettlementFailed(e) => Some(&e.symbol),
            Event::Overflow(_) => None,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, Event::Overflow(_))
    }
}

/// Subscription filter
///
/// `kinds: None` is the wildcard: every event including internal notices.
/// A symbol filter restricts symbol-bearing events only.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Option<HashSet<EventKind>>,
    pub symbols: Option<HashSet<String>>,
}

impl EventFilter {
    /// Everything, including internal notices
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            symbols: None,
        }
    }

    pub fn with_symbols(mut self, symbols: impl IntoIterator<Item = String>) -> Self {
        let set: HashSet<String> = symbols.into_iter().collect();
        if !set.is_empty() {
            self.symbols = Some(set);
        }
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        match event.kind() {
            Some(kind) => {
                if let Some(kinds) = &self.kinds {
                    if !kinds.contains(&kind) {
                        return false;
                    }
                }
            }
            // Internal notices go to wildcard subscribers only
            None => {
                if self.kinds.is_some() {
                    return false;
                }
            }
        }

        if let (Some(symbols), Some(symbol)) = (&self.symbols, event.symbol()) {
            if !symbols.contains(symbol) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price_event(symbol: &str) -> Event {
        Event::Price(PriceEvent {
            kind: EventKind::PriceUpdate,
            symbol: symbol.to_string(),
            price: dec!(150),
            change_pct: dec!(0.5),
            ts: 1,
        })
    }

    #[test]
    fn test_kind_strings_are_case_sensitive() {
        assert_eq!(
            "ORDER_PLACED".parse::<EventKind>().unwrap(),
            EventKind::OrderPlaced
        );
        assert!("order_placed".parse::<EventKind>().is_err());
        assert_eq!(EventKind::PriceUpdate.to_string(), "PRICE_UPDATE");
    }

    #[test]
    fn test_kind_serde_matches_display() {
        for kind in EventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_filter_by_kind_and_symbol() {
        let filter = EventFilter::for_kinds([EventKind::PriceUpdate])
            .with_symbols(["AAPL".to_string()]);

        assert!(filter.matches(&price_event("AAPL")));
        assert!(!filter.matches(&price_event("GOOG")));

        let other_kind = Event::Market(MarketEvent {
            kind: EventKind::OrderPlaced,
            order_id: Uuid::new_v4(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            qty: 1,
            price: dec!(1),
            investor: Uuid::new_v4(),
            ts: 1,
        });
        assert!(!filter.matches(&other_kind));
    }

    #[test]
    fn test_internal_notices_only_reach_wildcard() {
        let notice = Event::SettlementFailed(SettlementFailedNotice::new(
            Uuid::new_v4(),
            "AAPL".to_string(),
            "store error".to_string(),
            1,
        ));
        assert!(EventFilter::all().matches(&notice));
        assert!(!EventFilter::for_kinds([EventKind::OrderExecuted]).matches(&notice));
    }

    #[test]
    fn test_overflow_serializes_with_kind() {
        let json = serde_json::to_value(Event::Overflow(OverflowNotice::default())).unwrap();
        assert_eq!(json["kind"], "OVERFLOW");
    }
}
