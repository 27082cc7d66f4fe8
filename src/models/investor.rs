//! Investor, Holding and Transaction Models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::Side;

/// A registered investor
#[derive(Debug, Clone, Serialize)]
pub struct Investor {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub balance: Decimal,
    pub created_at: i64,
}

/// A position in one symbol. Deleted when qty reaches zero.
#[derive(Debug, Clone, Serialize)]
pub struct Holding {
    pub investor: Uuid,
    pub symbol: String,
    pub qty: i64,
    /// Weighted-average buy price; sells never change it
    pub avg_price: Decimal,
}

/// Holding decorated with market value for the portfolio view
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioPosition {
    pub symbol: String,
    pub qty: i64,
    pub avg_price: Decimal,
    pub current_price: Decimal,
    pub current_value: Decimal,
    pub profit_loss: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub investor: Uuid,
    pub balance: Decimal,
    pub positions: Vec<PortfolioPosition>,
    pub total_value: Decimal,
}

/// Append-only cash/share movement record
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub investor: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: Decimal,
    pub total: Decimal,
    pub ts: i64,
}

// ============================================================================
// API shapes
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub initial_balance: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdjustBalanceRequest {
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    #[serde(default)]
    pub limit_price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateOrderResponse {
    pub valid: bool,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionQuery {
    pub limit: Option<usize>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}
