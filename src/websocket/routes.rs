use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use super::handler;
use crate::AppState;

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/market", get(handler::market_stream))
        .route("/prices", get(handler::price_stream))
}
