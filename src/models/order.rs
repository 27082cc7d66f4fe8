//! Order and Execution Models
//!
//! Order entities, lifecycle enums and the API request/response shapes for
//! the market surface.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(format!("invalid order side: {}", s)),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Resting in the book, nothing filled yet
    Pending,
    /// Some quantity filled, remainder still live
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Cancelled by the owner
    Canceled,
    /// Rejected before admission (validation, funds, market state)
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELED" => Ok(OrderStatus::Canceled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            _ => Err(format!("invalid order status: {}", s)),
        }
    }
}

/// A live order
///
/// `limit_price == 0` marks a market order: it executes at whatever the book
/// offers and carries no price of its own.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub investor: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub limit_price: Decimal,
    pub filled: i64,
    pub status: OrderStatus,
    pub created_at: i64,
    pub updated_at: i64,

    /// Cumulative notional of fills, used to derive the average fill price
    #[serde(skip)]
    pub fill_notional: Decimal,
}

impl Order {
    pub fn new(
        id: Uuid,
        investor: Uuid,
        symbol: String,
        side: Side,
        qty: i64,
        limit_price: Decimal,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id,
            investor,
            symbol,
            side,
            qty,
            limit_price,
            filled: 0,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            fill_notional: Decimal::ZERO,
        }
    }

    pub fn remaining(&self) -> i64 {
        self.qty - self.filled
    }

    /// Market orders carry no limit price
    pub fn is_market(&self) -> bool {
        self.limit_price.is_zero()
    }

    /// Average price over all fills so far
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        if self.filled > 0 {
            Some(self.fill_notional / Decimal::from(self.filled))
        } else {
            None
        }
    }

    /// Record a fill and derive the resulting status
    pub fn apply_fill(&mut self, qty: i64, price: Decimal) {
        self.filled += qty;
        self.fill_notional += Decimal::from(qty) * price;
        self.status = if self.filled >= self.qty {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = Utc::now().timestamp_millis();
    }
}

/// One match between a resting and an incoming order. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: Uuid,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub symbol: String,
    pub qty: i64,
    pub price: Decimal,
    pub buyer: Uuid,
    pub seller: Uuid,
    /// Side of the aggressor: the market order, or the later-arrived limit
    pub aggressor: Side,
    pub ts: i64,
}

// ============================================================================
// API shapes
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderRequest {
    pub investor: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    /// Zero (or omitted) places a market order
    #[serde(default)]
    pub limit_price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelOrderRequest {
    pub investor: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOrderResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled: i64,
    pub remaining: i64,
    pub avg_price: Option<Decimal>,
}

/// One aggregated price level of the depth view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub qty: i64,
    pub count: usize,
}

/// Price-aggregated book depth, both sides
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookDepth {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub ts: i64,
}
