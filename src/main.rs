use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod error;
mod models;
mod services;
mod websocket;

use crate::config::AppConfig;
use crate::db::Database;
use crate::services::analytics::{spawn_top_stocks_worker, AnalyticsRecorder};
use crate::services::events::EventBus;
use crate::services::market::{spawn_market_hours_worker, MarketService};
use crate::services::matching::MatchingEngine;
use crate::services::portfolio::PortfolioStore;
use crate::services::price::PriceEngine;
use crate::services::settlement::SettlementCoordinator;
use crate::services::webhooks::{spawn_delivery_worker, WebhookService};

pub struct AppState {
    pub db: Database,
    pub bus: EventBus,
    pub market: Arc<MarketService>,
    pub price: Arc<PriceEngine>,
    pub portfolio: Arc<PortfolioStore>,
    pub analytics: Arc<AnalyticsRecorder>,
    pub webhooks: Arc<WebhookService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    // Initialize tracing; RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("tickerd={},tower_http=info", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tickerd v{}", env!("CARGO_PKG_VERSION"));

    // Shared store
    let db = Database::connect(&config.database_path).await?;

    // Event bus
    let bus = EventBus::with_capacity(config.event_queue_capacity);

    // Services
    let portfolio = Arc::new(PortfolioStore::new(db.clone(), bus.clone()));
    let price = Arc::new(PriceEngine::new(
        db.clone(),
        bus.clone(),
        config.price_volatility_factor,
        config.price_alert_pct,
    ));
    let analytics = Arc::new(AnalyticsRecorder::new(db.clone(), bus.clone()));
    let engine = Arc::new(MatchingEngine::new(bus.clone()));
    let settlement = Arc::new(SettlementCoordinator::new(
        db.clone(),
        Arc::clone(&portfolio),
        Arc::clone(&price),
        Arc::clone(&analytics),
        bus.clone(),
    ));
    let market = Arc::new(MarketService::new(
        engine,
        settlement,
        Arc::clone(&portfolio),
        Arc::clone(&price),
        db.clone(),
    ));
    let webhooks = Arc::new(WebhookService::new(db.clone(), config.webhook_max_attempts));

    // Seed configured stocks (existing quotes are restored, not reset)
    price.seed(&config.stock_seeds()).await?;

    // Background workers
    spawn_delivery_worker(Arc::clone(&webhooks), bus.clone());
    spawn_top_stocks_worker(Arc::clone(&analytics), bus.clone(), Duration::from_secs(60));
    if let Some((open_hour, close_hour)) = config.market_hours() {
        spawn_market_hours_worker(Arc::clone(&market), open_hour, close_hour);
    }

    let state = Arc::new(AppState {
        db,
        bus,
        market,
        price,
        portfolio,
        analytics,
        webhooks,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .merge(api::routes::create_webhook_router(state.clone()))
        .nest("/ws", websocket::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database = state.db.health_check().await;
    Json(serde_json::json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
        "market_state": state.market.state(),
        "subscribers": state.bus.subscriber_count(),
    }))
}
