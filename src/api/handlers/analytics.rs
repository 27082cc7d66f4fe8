//! Analytics Handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::order::Side;
use crate::services::analytics::{
    InvestorPerformance, MarketStats, PricePrediction, TopTradedEntry, VolatilityEntry,
    VolumeBucket,
};
use crate::AppState;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub limit: Option<usize>,
    pub window_ms: Option<i64>,
}

pub async fn top_traded(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> CoreResult<Json<Vec<TopTradedEntry>>> {
    let entries = state
        .analytics
        .top_traded(
            query.limit.unwrap_or(10).min(100),
            query.window_ms.unwrap_or(DAY_MS),
        )
        .await?;
    Ok(Json(entries))
}

pub async fn most_volatile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> CoreResult<Json<Vec<VolatilityEntry>>> {
    let entries = state
        .analytics
        .most_volatile(
            query.limit.unwrap_or(10).min(100),
            query.window_ms.unwrap_or(DAY_MS),
        )
        .await?;
    Ok(Json(entries))
}

pub async fn market_stats(State(state): State<Arc<AppState>>) -> CoreResult<Json<MarketStats>> {
    Ok(Json(state.analytics.market_stats().await?))
}

pub async fn investor_performance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> CoreResult<Json<InvestorPerformance>> {
    Ok(Json(state.analytics.investor_performance(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub horizon_min: Option<i64>,
}

pub async fn predict_price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<PredictQuery>,
) -> CoreResult<Json<PricePrediction>> {
    let symbol = symbol.trim().to_uppercase();
    let prediction = state
        .analytics
        .predict_price(&symbol, query.horizon_min.unwrap_or(60))
        .await?;
    Ok(Json(prediction))
}

#[derive(Debug, Deserialize)]
pub struct VolumeQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub interval_ms: Option<i64>,
}

pub async fn trading_volume(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<VolumeQuery>,
) -> CoreResult<Json<Vec<VolumeBucket>>> {
    let symbol = symbol.trim().to_uppercase();
    let buckets = state
        .analytics
        .trading_volume(
            &symbol,
            query.start,
            query.end,
            query.interval_ms.unwrap_or(60_000),
        )
        .await?;
    Ok(Json(buckets))
}

#[derive(Debug, Deserialize)]
pub struct RecordTradeRequest {
    pub investor: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: f64,
    pub ts: Option<i64>,
}

pub async fn record_trade(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordTradeRequest>,
) -> CoreResult<Json<serde_json::Value>> {
    state
        .analytics
        .record_trade(
            req.investor,
            &req.symbol.trim().to_uppercase(),
            req.side,
            req.qty,
            req.price,
            req.ts,
        )
        .await?;
    Ok(Json(serde_json::json!({ "recorded": true })))
}
