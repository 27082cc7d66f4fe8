use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use std::sync::Arc;

use crate::api::handlers;
use crate::AppState;

/// The versioned core API
pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // Orders
        .route("/orders", post(handlers::market::place_order))
        .route("/orders/:order_id", get(handlers::market::get_order))
        .route("/orders/:order_id", delete(handlers::market::cancel_order))
        // Market
        .route("/market/:symbol/orderbook", get(handlers::market::get_orderbook))
        .route("/market/:symbol/trades", get(handlers::market::recent_trades))
        .route("/market/state", get(handlers::market::get_market_state))
        .route("/market/state", put(handlers::market::set_market_state))
        .route("/market/stats", get(handlers::market::engine_stats))
        // Prices
        .route("/prices", get(handlers::price::list_prices))
        .route("/prices", post(handlers::price::initialize_stock))
        .route("/prices/:symbol", get(handlers::price::get_price))
        .route("/prices/:symbol", put(handlers::price::update_price))
        .route("/prices/:symbol/history", get(handlers::price::get_history))
        // Investors
        .route("/investors", post(handlers::investor::register))
        .route("/investors/:id", get(handlers::investor::get))
        .route("/investors/:id/balance", post(handlers::investor::update_balance))
        .route("/investors/:id/portfolio", get(handlers::investor::portfolio))
        .route("/investors/:id/transactions", get(handlers::investor::transactions))
        .route("/investors/:id/validate-order", post(handlers::investor::validate_order))
        .route("/investors/:id/orders", get(handlers::investor::orders))
        // Analytics
        .route("/analytics/top-traded", get(handlers::analytics::top_traded))
        .route("/analytics/most-volatile", get(handlers::analytics::most_volatile))
        .route("/analytics/market-stats", get(handlers::analytics::market_stats))
        .route("/analytics/performance/:id", get(handlers::analytics::investor_performance))
        .route("/analytics/predict/:symbol", get(handlers::analytics::predict_price))
        .route("/analytics/volume/:symbol", get(handlers::analytics::trading_volume))
        .route("/analytics/trades", post(handlers::analytics::record_trade))
}

/// Webhook management and manual event publishing, mounted unversioned
pub fn create_webhook_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks", post(handlers::webhook::create))
        .route("/webhooks", get(handlers::webhook::list))
        .route("/webhooks/test", post(handlers::webhook::test))
        .route("/webhooks/:id", get(handlers::webhook::get))
        .route("/webhooks/:id", delete(handlers::webhook::delete))
        .route("/webhooks/:id", patch(handlers::webhook::patch))
        .route("/events", post(handlers::webhook::publish_event))
        .route("/events/types", get(handlers::webhook::event_types))
}
