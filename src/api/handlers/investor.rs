//! Investor Handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::investor::{
    AdjustBalanceRequest, Investor, Portfolio, RegisterRequest, Transaction, TransactionQuery,
    ValidateOrderRequest, ValidateOrderResponse,
};
use crate::models::order::{Order, OrderStatus};
use crate::AppState;

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> CoreResult<Json<Investor>> {
    let investor = state
        .portfolio
        .register(&req.name, &req.email, req.initial_balance)
        .await?;
    Ok(Json(investor))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> CoreResult<Json<Investor>> {
    Ok(Json(state.portfolio.get(id).await?))
}

pub async fn update_balance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AdjustBalanceRequest>,
) -> CoreResult<Json<Investor>> {
    Ok(Json(
        state
            .portfolio
            .adjust_balance(id, req.amount, &req.reason)
            .await?,
    ))
}

pub async fn portfolio(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> CoreResult<Json<Portfolio>> {
    let prices = state.price.current_prices().await;
    Ok(Json(state.portfolio.portfolio(id, &prices).await?))
}

pub async fn transactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<TransactionQuery>,
) -> CoreResult<Json<Vec<Transaction>>> {
    let entries = state
        .portfolio
        .transactions(
            id,
            query.limit.unwrap_or(50).min(500),
            query.start,
            query.end,
        )
        .await?;
    Ok(Json(entries))
}

/// Pre-trade check. Funds/shares shortfalls answer `valid: false`; unknown
/// investors are a proper 404.
pub async fn validate_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ValidateOrderRequest>,
) -> CoreResult<Json<ValidateOrderResponse>> {
    let result = state
        .portfolio
        .validate_order(id, &req.symbol.trim().to_uppercase(), req.side, req.qty, req.limit_price)
        .await;

    match result {
        Ok(()) => Ok(Json(ValidateOrderResponse {
            valid: true,
            message: "ok".to_string(),
        })),
        Err(
            e @ (CoreError::InsufficientFunds(_) | CoreError::InsufficientShares(_)),
        ) => Ok(Json(ValidateOrderResponse {
            valid: false,
            message: format!("{}: {}", e.code(), e),
        })),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
}

pub async fn orders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<OrdersQuery>,
) -> CoreResult<Json<Vec<Order>>> {
    let orders = state
        .market
        .orders_for_investor(id, query.status, query.limit.unwrap_or(50).min(500))
        .await?;
    Ok(Json(orders))
}
