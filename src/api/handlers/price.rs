//! Price Handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use std::sync::Arc;

use crate::error::CoreResult;
use crate::models::stock::{
    InitializeStockRequest, PriceHistoryQuery, PricePoint, StockQuote, UpdatePriceRequest,
};
use crate::AppState;

pub async fn list_prices(State(state): State<Arc<AppState>>) -> Json<Vec<StockQuote>> {
    Json(state.price.get_prices().await)
}

pub async fn get_price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> CoreResult<Json<StockQuote>> {
    let symbol = symbol.trim().to_uppercase();
    Ok(Json(state.price.get_price(&symbol).await?))
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<PriceHistoryQuery>,
) -> CoreResult<Json<Vec<PricePoint>>> {
    let symbol = symbol.trim().to_uppercase();
    let history = state
        .price
        .history(
            &symbol,
            query.start,
            query.end,
            query.limit.unwrap_or(100).min(1000),
        )
        .await?;
    Ok(Json(history))
}

pub async fn update_price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(req): Json<UpdatePriceRequest>,
) -> CoreResult<Json<StockQuote>> {
    let symbol = symbol.trim().to_uppercase();
    Ok(Json(state.price.update_price(&symbol, req.price).await?))
}

pub async fn initialize_stock(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitializeStockRequest>,
) -> CoreResult<Json<StockQuote>> {
    Ok(Json(
        state
            .price
            .initialize_stock(&req.symbol, &req.name, req.price)
            .await?,
    ))
}
