//! Market Handlers
//!
//! Order placement, cancellation, status, depth and market state.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::order::{
    CancelOrderRequest, CancelOrderResponse, OrderBookDepth, OrderStatusResponse,
    PlaceOrderRequest, PlaceOrderResponse,
};
use crate::services::market::MarketState;
use crate::services::matching::EngineStats;
use crate::AppState;

pub async fn place_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> CoreResult<Json<PlaceOrderResponse>> {
    let response = state.market.place_order(req).await?;
    Ok(Json(response))
}

/// Cancel keeps the RPC's soft-failure contract: domain failures come back
/// as `success: false` rather than an error status.
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<CancelOrderRequest>,
) -> CoreResult<Json<CancelOrderResponse>> {
    match state.market.cancel_order(order_id, req.investor).await {
        Ok(response) => Ok(Json(response)),
        Err(
            e @ (CoreError::NotFound(_) | CoreError::Conflict(_) | CoreError::Validation(_)),
        ) => Ok(Json(CancelOrderResponse {
            success: false,
            message: e.to_string(),
        })),
        Err(e) => Err(e),
    }
}

pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> CoreResult<Json<OrderStatusResponse>> {
    Ok(Json(state.market.order_status(order_id).await?))
}

pub async fn get_orderbook(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> CoreResult<Json<OrderBookDepth>> {
    Ok(Json(state.market.order_book(&symbol)?))
}

#[derive(Debug, Serialize)]
pub struct MarketStateResponse {
    pub state: MarketState,
}

pub async fn get_market_state(State(state): State<Arc<AppState>>) -> Json<MarketStateResponse> {
    Json(MarketStateResponse {
        state: state.market.state(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SetMarketStateRequest {
    pub state: MarketState,
}

pub async fn set_market_state(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetMarketStateRequest>,
) -> CoreResult<Json<MarketStateResponse>> {
    let new_state = state.market.set_state(req.state).await?;
    Ok(Json(MarketStateResponse { state: new_state }))
}

pub async fn engine_stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.market.engine_stats())
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TradeView {
    pub qty: i64,
    pub price: f64,
    pub ts: i64,
}

pub async fn recent_trades(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<TradesQuery>,
) -> CoreResult<Json<Vec<TradeView>>> {
    let symbol = symbol.trim().to_uppercase();
    let rows = state
        .analytics
        .recent_trades(&symbol, query.limit.unwrap_or(50).min(500))
        .await?;
    Ok(Json(
        rows.into_iter()
            .map(|(qty, price, ts)| TradeView { qty, price, ts })
            .collect(),
    ))
}
