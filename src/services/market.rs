//! Market Service
//!
//! Front door of the trading core. Validates incoming orders against the
//! portfolio store, admits them to the matching engine and drives every
//! resulting execution through settlement before the next order on the same
//! symbol is admitted. Serialization is a per-symbol async lock; distinct
//! symbols proceed in parallel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{decimal_from_text, Database};
use crate::error::{CoreError, CoreResult};
use crate::models::order::{
    CancelOrderResponse, Order, OrderBookDepth, OrderStatus, OrderStatusResponse,
    PlaceOrderRequest, PlaceOrderResponse, Side,
};
use crate::services::matching::{EngineStats, MatchingEngine};
use crate::services::portfolio::PortfolioStore;
use crate::services::price::{PriceEngine, BOOK_PRESSURE_IMPACT};
use crate::services::settlement::SettlementCoordinator;

/// Deadline for one place/cancel call. On expiry the caller gets
/// `DEADLINE_EXCEEDED` while the admitted work runs to completion — a trade
/// that matched will still settle and its events will still fire.
const RPC_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketState {
    Open,
    Closed,
    Paused,
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketState::Open => write!(f, "OPEN"),
            MarketState::Closed => write!(f, "CLOSED"),
            MarketState::Paused => write!(f, "PAUSED"),
        }
    }
}

pub struct MarketService {
    engine: Arc<MatchingEngine>,
    settlement: Arc<SettlementCoordinator>,
    portfolio: Arc<PortfolioStore>,
    price: Arc<PriceEngine>,
    db: Database,
    /// symbol -> admission lock; matching and settlement for a symbol run
    /// under it end to end
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
    state: RwLock<MarketState>,
}

impl MarketService {
    pub fn new(
        engine: Arc<MatchingEngine>,
        settlement: Arc<SettlementCoordinator>,
        portfolio: Arc<PortfolioStore>,
        price: Arc<PriceEngine>,
        db: Database,
    ) -> Self {
        Self {
            engine,
            settlement,
            portfolio,
            price,
            db,
            symbol_locks: DashMap::new(),
            state: RwLock::new(MarketState::Open),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Market state
    // ========================================================================

    pub fn state(&self) -> MarketState {
        *self.state.read()
    }

    /// Switch market state. The CLOSED/PAUSED -> OPEN transition starts a
    /// fresh trading day on the price engine.
    pub async fn set_state(&self, next: MarketState) -> CoreResult<MarketState> {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            *state = next;
            previous
        };

        if next == MarketState::Open && previous != MarketState::Open {
            self.price.reset_daily().await?;
        }
        if previous != next {
            info!(%previous, %next, "market state changed");
        }
        Ok(next)
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Place an order. Domain rejections (funds, shares, market closed) come
    /// back as a `REJECTED` order rather than an error; malformed input is an
    /// error and changes nothing.
    pub async fn place_order(
        self: &Arc<Self>,
        req: PlaceOrderRequest,
    ) -> CoreResult<PlaceOrderResponse> {
        if req.qty <= 0 {
            return Err(CoreError::Validation("qty must be positive".to_string()));
        }
        if req.limit_price < Decimal::ZERO {
            return Err(CoreError::Validation(
                "limit_price must not be negative".to_string(),
            ));
        }
        let symbol = req.symbol.trim().to_uppercase();
        if !self.price.has_symbol(&symbol) {
            return Err(CoreError::NotFound(format!("unknown symbol: {}", symbol)));
        }

        let order = Order::new(
            Uuid::new_v4(),
            req.investor,
            symbol.clone(),
            req.side,
            req.qty,
            req.limit_price.normalize(),
        );

        let state = self.state();
        if state != MarketState::Open {
            return self
                .reject(order, CoreError::MarketClosed(state.to_string()))
                .await;
        }

        // Affordability / availability. A market buy has no limit price, so
        // the current quote stands in as the cost estimate.
        let check_price = if order.is_market() && order.side == Side::Buy {
            self.price.get_price(&symbol).await?.current
        } else {
            order.limit_price
        };
        match self
            .portfolio
            .validate_order(req.investor, &symbol, req.side, req.qty, check_price)
            .await
        {
            Ok(()) => {}
            Err(
                cause @ (CoreError::InsufficientFunds(_) | CoreError::InsufficientShares(_)),
            ) => {
                return self.reject(order, cause).await;
            }
            Err(e) => return Err(e),
        }

        // The admitted pipeline runs detached so a caller deadline cannot
        // abort half-settled work.
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move { service.run_pipeline(order).await });

        match tokio::time::timeout(RPC_DEADLINE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CoreError::internal(format!(
                "order pipeline panicked: {}",
                join_err
            ))),
            Err(_) => {
                warn!("place_order deadline elapsed; pipeline continues");
                Err(CoreError::DeadlineExceeded)
            }
        }
    }

    /// Admission, matching, settlement and persistence for one order, all
    /// under the symbol lock
    async fn run_pipeline(self: Arc<Self>, order: Order) -> CoreResult<PlaceOrderResponse> {
        let lock = self.symbol_lock(&order.symbol);
        let _guard = lock.lock().await;

        let order_id = order.id;
        let symbol = order.symbol.clone();
        let side = order.side;

        let executions = self.engine.admit(order)?;

        for execution in &executions {
            if let Err(e) = self.settlement.settle(execution).await {
                // The execution is flagged and the compensation notice is
                // already out; later executions still settle.
                error!(execution = %execution.id, "settlement error: {}", e);
            }
            for affected in [execution.buy_order_id, execution.sell_order_id] {
                if let Some(snapshot) = self.engine.order(&affected) {
                    self.persist_order(&snapshot).await?;
                }
            }
        }

        let latest = self
            .engine
            .order(&order_id)
            .ok_or_else(|| CoreError::internal("admitted order vanished"))?;
        self.persist_order(&latest).await?;

        // A remainder resting on the book shows pressure at reduced weight.
        if !latest.status.is_terminal() && latest.remaining() > 0 {
            if let Err(e) = self
                .price
                .apply(&symbol, latest.remaining(), side == Side::Buy, BOOK_PRESSURE_IMPACT)
                .await
            {
                error!(%symbol, "book pressure apply failed: {}", e);
            }
        }

        let message = match latest.status {
            OrderStatus::Filled => format!("filled {} @ avg {}", latest.filled, fmt_avg(&latest)),
            OrderStatus::PartiallyFilled => {
                format!("filled {} of {}, remainder resting", latest.filled, latest.qty)
            }
            _ => "order resting on book".to_string(),
        };

        Ok(PlaceOrderResponse {
            order_id,
            status: latest.status,
            message,
        })
    }

    /// Persist a rejection and answer with the terminal order
    async fn reject(&self, mut order: Order, cause: CoreError) -> CoreResult<PlaceOrderResponse> {
        order.status = OrderStatus::Rejected;
        self.persist_order(&order).await?;
        info!(order_id = %order.id, code = cause.code(), "order rejected");
        Ok(PlaceOrderResponse {
            order_id: order.id,
            status: OrderStatus::Rejected,
            message: format!("{}: {}", cause.code(), cause),
        })
    }

    /// Cancel a resting order
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        investor: Uuid,
    ) -> CoreResult<CancelOrderResponse> {
        let order = match self.engine.order(&order_id) {
            Some(order) => order,
            None => {
                // Rejected orders never reached the engine but do exist
                return match self.load_order(order_id).await? {
                    Some(row) => Err(CoreError::Conflict(format!(
                        "order {} is already {}",
                        order_id, row.status
                    ))),
                    None => Err(CoreError::NotFound(format!("unknown order: {}", order_id))),
                };
            }
        };

        let lock = self.symbol_lock(&order.symbol);
        let _guard = lock.lock().await;

        let canceled = self.engine.cancel(order_id, investor)?;
        self.persist_order(&canceled).await?;

        Ok(CancelOrderResponse {
            success: true,
            message: format!("canceled with {} unfilled", canceled.remaining()),
        })
    }

    pub async fn order_status(&self, order_id: Uuid) -> CoreResult<OrderStatusResponse> {
        let order = match self.engine.order(&order_id) {
            Some(order) => order,
            None => self
                .load_order(order_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("unknown order: {}", order_id)))?,
        };

        Ok(OrderStatusResponse {
            order_id,
            status: order.status,
            filled: order.filled,
            remaining: order.remaining(),
            avg_price: order.avg_fill_price(),
        })
    }

    pub fn order_book(&self, symbol: &str) -> CoreResult<OrderBookDepth> {
        let symbol = symbol.trim().to_uppercase();
        if !self.price.has_symbol(&symbol) {
            return Err(CoreError::NotFound(format!("unknown symbol: {}", symbol)));
        }
        Ok(self.engine.depth(&symbol))
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// An investor's orders, newest first, optionally filtered by status
    pub async fn orders_for_investor(
        &self,
        investor: Uuid,
        status: Option<OrderStatus>,
        limit: usize,
    ) -> CoreResult<Vec<Order>> {
        let rows: Vec<OrderRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT id, investor, symbol, side, qty, limit_price, filled, status,
                            created_at, updated_at
                     FROM orders WHERE investor = ? AND status = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(investor.to_string())
                .bind(status.to_string())
                .bind(limit as i64)
                .fetch_all(&self.db.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, investor, symbol, side, qty, limit_price, filled, status,
                            created_at, updated_at
                     FROM orders WHERE investor = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(investor.to_string())
                .bind(limit as i64)
                .fetch_all(&self.db.pool)
                .await?
            }
        };

        rows.into_iter().map(Order::try_from).collect()
    }

    // ========================================================================
    // Order persistence (the store copy always tracks the engine copy)
    // ========================================================================

    async fn persist_order(&self, order: &Order) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO orders
                 (id, investor, symbol, side, qty, limit_price, filled, status,
                  created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                 filled = excluded.filled,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
        )
        .bind(order.id.to_string())
        .bind(order.investor.to_string())
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.qty)
        .bind(order.limit_price.to_string())
        .bind(order.filled)
        .bind(order.status.to_string())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn load_order(&self, order_id: Uuid) -> CoreResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(
            "SELECT id, investor, symbol, side, qty, limit_price, filled, status,
                    created_at, updated_at
             FROM orders WHERE id = ?",
        )
        .bind(order_id.to_string())
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }
}

fn fmt_avg(order: &Order) -> String {
    order
        .avg_fill_price()
        .map(|p| p.round_dp(4).to_string())
        .unwrap_or_else(|| "-".to_string())
}

type OrderRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
    String,
    i64,
    i64,
);

impl TryFrom<OrderRow> for Order {
    type Error = CoreError;

    fn try_from(row: OrderRow) -> CoreResult<Self> {
        let (id, investor, symbol, side, qty, limit_price, filled, status, created_at, updated_at) =
            row;
        Ok(Order {
            id: Uuid::parse_str(&id)
                .map_err(|e| CoreError::internal(format!("bad order id in store: {}", e)))?,
            investor: Uuid::parse_str(&investor)
                .map_err(|e| CoreError::internal(format!("bad investor id in store: {}", e)))?,
            symbol,
            side: side.parse().map_err(|e: String| CoreError::internal(e))?,
            qty,
            limit_price: decimal_from_text(&limit_price)?,
            filled,
            status: status.parse().map_err(|e: String| CoreError::internal(e))?,
            created_at,
            updated_at,
            fill_notional: Decimal::ZERO,
        })
    }
}

/// Flip market state on the configured UTC hours; the CLOSED -> OPEN edge
/// runs the daily price reset.
pub fn spawn_market_hours_worker(service: Arc<MarketService>, open_hour: u32, close_hour: u32) {
    tokio::spawn(async move {
        use chrono::Timelike;
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(open_hour, close_hour, "market hours worker started");
        loop {
            ticker.tick().await;
            let hour = chrono::Utc::now().hour();
            let in_session = if open_hour <= close_hour {
                hour >= open_hour && hour < close_hour
            } else {
                // Overnight session, e.g. 22 -> 4
                hour >= open_hour || hour < close_hour
            };
            let desired = if in_session {
                MarketState::Open
            } else {
                MarketState::Closed
            };
            let current = service.state();
            if current != desired && current != MarketState::Paused {
                if let Err(e) = service.set_state(desired).await {
                    error!("market hours transition failed: {}", e);
                }
            }
        }
    });
}
