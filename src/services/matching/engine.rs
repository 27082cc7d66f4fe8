//! Matching Engine
//!
//! Owns the per-symbol order books and the live order store. Matching is
//! deterministic and infallible given well-formed input; malformed orders
//! and duplicate ids are rejected synchronously. The engine itself does no
//! settlement — it emits executions for the coordinator to apply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use super::book::{BookOrder, OrderBook};
use crate::error::{CoreError, CoreResult};
use crate::models::event::MarketEvent;
use crate::models::order::{Execution, Order, OrderBookDepth, OrderStatus};
use crate::services::events::EventBus;

pub struct MatchingEngine {
    /// Symbol to book. Each book is only touched under the market service's
    /// per-symbol lock.
    books: DashMap<String, Arc<RwLock<OrderBook>>>,

    /// Every order ever admitted, by id
    orders: DashMap<Uuid, Order>,

    /// Global arrival sequence for time priority
    seq: AtomicU64,

    bus: EventBus,
}

impl MatchingEngine {
    pub fn new(bus: EventBus) -> Self {
        Self {
            books: DashMap::new(),
            orders: DashMap::new(),
            seq: AtomicU64::new(1),
            bus,
        }
    }

    fn book(&self, symbol: &str) -> Arc<RwLock<OrderBook>> {
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new(symbol.to_string()))))
            .clone()
    }

    /// Admit a pre-validated order: publish `ORDER_PLACED`, insert it, then
    /// run the match loop. Returns the executions produced by this call.
    pub fn admit(&self, order: Order) -> CoreResult<Vec<Execution>> {
        if order.qty <= 0 {
            return Err(CoreError::Validation("qty must be positive".to_string()));
        }
        if order.limit_price < Decimal::ZERO {
            return Err(CoreError::Validation(
                "limit_price must not be negative".to_string(),
            ));
        }
        if order.symbol.is_empty() {
            return Err(CoreError::Validation("symbol must not be empty".to_string()));
        }
        if self.orders.contains_key(&order.id) {
            return Err(CoreError::Conflict(format!(
                "order id already used: {}",
                order.id
            )));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let book = self.book(&order.symbol);

        debug!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = %order.side,
            qty = order.qty,
            limit = %order.limit_price,
            "admitting order"
        );

        self.orders.insert(order.id, order.clone());
        self.bus.publish(crate::models::event::Event::Market(
            MarketEvent::placed(&order),
        ));

        let mut book = book.write();
        book.insert(BookOrder {
            id: order.id,
            investor: order.investor,
            side: order.side,
            qty: order.qty,
            filled: order.filled,
            limit_price: order.limit_price,
            seq,
        });

        let mut executions = Vec::new();
        while let Some(m) = book.cross_once() {
            let execution = Execution {
                id: Uuid::new_v4(),
                buy_order_id: m.buy_order_id,
                sell_order_id: m.sell_order_id,
                symbol: order.symbol.clone(),
                qty: m.qty,
                price: m.price,
                buyer: m.buy_investor,
                seller: m.sell_investor,
                aggressor: m.aggressor,
                ts: Utc::now().timestamp_millis(),
            };

            if let Some(mut buy) = self.orders.get_mut(&m.buy_order_id) {
                buy.apply_fill(m.qty, m.price);
            }
            if let Some(mut sell) = self.orders.get_mut(&m.sell_order_id) {
                sell.apply_fill(m.qty, m.price);
            }

            executions.push(execution);
        }

        if !executions.is_empty() {
            info!(
                order_id = %order.id,
                symbol = %order.symbol,
                count = executions.len(),
                "match loop produced executions"
            );
        }

        Ok(executions)
    }

    /// Cancel a live order owned by `investor`
    pub fn cancel(&self, order_id: Uuid, investor: Uuid) -> CoreResult<Order> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| CoreError::NotFound(format!("unknown order: {}", order_id)))?;

        if order.investor != investor {
            return Err(CoreError::Validation(format!(
                "order {} is not owned by {}",
                order_id, investor
            )));
        }
        if order.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }

        let book = self.book(&order.symbol);
        book.write().remove(&order_id);

        order.status = OrderStatus::Canceled;
        order.updated_at = Utc::now().timestamp_millis();
        let canceled = order.clone();
        drop(order);

        self.bus.publish(crate::models::event::Event::Market(
            MarketEvent::canceled(&canceled),
        ));
        info!(order_id = %order_id, "order canceled");

        Ok(canceled)
    }

    /// Snapshot of one order
    pub fn order(&self, order_id: &Uuid) -> Option<Order> {
        self.orders.get(order_id).map(|o| o.clone())
    }

    /// Price-aggregated depth for a symbol
    pub fn depth(&self, symbol: &str) -> OrderBookDepth {
        let (bids, asks) = match self.books.get(symbol) {
            Some(book) => book.read().depth(),
            None => (Vec::new(), Vec::new()),
        };
        OrderBookDepth {
            symbol: symbol.to_string(),
            bids,
            asks,
            ts: Utc::now().timestamp_millis(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let mut resting = 0usize;
        let mut bid_depth = 0i64;
        let mut ask_depth = 0i64;
        for entry in self.books.iter() {
            let book = entry.read();
            resting += book.resting_count();
            bid_depth += book.side_depth(crate::models::order::Side::Buy);
            ask_depth += book.side_depth(crate::models::order::Side::Sell);
        }
        EngineStats {
            symbols: self.books.len(),
            resting_orders: resting,
            bid_depth,
            ask_depth,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub symbols: usize,
    pub resting_orders: usize,
    pub bid_depth: i64,
    pub ask_depth: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::{Event, EventFilter};
    use crate::models::order::Side;
    use rust_decimal_macros::dec;

    fn engine() -> MatchingEngine {
        MatchingEngine::new(EventBus::new())
    }

    fn order(symbol: &str, side: Side, qty: i64, limit: Decimal) -> Order {
        Order::new(Uuid::new_v4(), Uuid::new_v4(), symbol.to_string(), side, qty, limit)
    }

    #[test]
    fn test_admit_rest_then_match() {
        let engine = engine();

        let sell = order("AAPL", Side::Sell, 10, dec!(151));
        assert!(engine.admit(sell.clone()).unwrap().is_empty());

        let buy = order("AAPL", Side::Buy, 10, dec!(151));
        let executions = engine.admit(buy.clone()).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].price, dec!(151));
        assert_eq!(executions[0].qty, 10);
        assert_eq!(executions[0].buyer, buy.investor);
        assert_eq!(executions[0].seller, sell.investor);
        assert_eq!(executions[0].aggressor, Side::Buy);

        assert_eq!(engine.order(&buy.id).unwrap().status, OrderStatus::Filled);
        assert_eq!(engine.order(&sell.id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let engine = engine();
        let first = order("AAPL", Side::Buy, 10, dec!(150));
        engine.admit(first.clone()).unwrap();

        let duplicate = Order { filled: 0, ..first };
        let err = engine.admit(duplicate).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        // No double insert: the book still holds a single resting order.
        assert_eq!(engine.stats().resting_orders, 1);
    }

    #[test]
    fn test_malformed_orders_rejected() {
        let engine = engine();
        assert_eq!(
            engine
                .admit(order("AAPL", Side::Buy, 0, dec!(150)))
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
        assert_eq!(
            engine
                .admit(order("AAPL", Side::Buy, 10, dec!(-1)))
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
        assert_eq!(
            engine
                .admit(order("", Side::Buy, 10, dec!(150)))
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
    }

    #[test]
    fn test_partial_fill_status() {
        let engine = engine();
        engine.admit(order("AAPL", Side::Sell, 30, dec!(149))).unwrap();

        let buy = order("AAPL", Side::Buy, 100, dec!(149));
        let executions = engine.admit(buy.clone()).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].qty, 30);

        let stored = engine.order(&buy.id).unwrap();
        assert_eq!(stored.status, OrderStatus::PartiallyFilled);
        assert_eq!(stored.filled, 30);
        assert_eq!(stored.remaining(), 70);
    }

    #[test]
    fn test_cancel_flow() {
        let engine = engine();
        let buy = order("AAPL", Side::Buy, 100, dec!(149));
        engine.admit(buy.clone()).unwrap();

        // Wrong owner
        assert_eq!(
            engine.cancel(buy.id, Uuid::new_v4()).unwrap_err().code(),
            "VALIDATION"
        );

        let canceled = engine.cancel(buy.id, buy.investor).unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert_eq!(engine.stats().resting_orders, 0);

        // Terminal orders cannot cancel again
        assert_eq!(
            engine.cancel(buy.id, buy.investor).unwrap_err().code(),
            "CONFLICT"
        );

        // Unknown order
        assert_eq!(
            engine
                .cancel(Uuid::new_v4(), buy.investor)
                .unwrap_err()
                .code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn test_canceled_order_cannot_fill() {
        let engine = engine();
        let buy = order("AAPL", Side::Buy, 10, dec!(150));
        engine.admit(buy.clone()).unwrap();
        engine.cancel(buy.id, buy.investor).unwrap();

        let executions = engine.admit(order("AAPL", Side::Sell, 10, dec!(150))).unwrap();
        assert!(executions.is_empty());
    }

    #[test]
    fn test_market_order_sweep_totals() {
        let engine = engine();
        engine.admit(order("AAPL", Side::Sell, 20, dec!(150))).unwrap();
        engine.admit(order("AAPL", Side::Sell, 30, dec!(151))).unwrap();

        let buy = order("AAPL", Side::Buy, 40, Decimal::ZERO);
        let executions = engine.admit(buy.clone()).unwrap();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].price, dec!(150));
        assert_eq!(executions[0].qty, 20);
        assert_eq!(executions[1].price, dec!(151));
        assert_eq!(executions[1].qty, 20);

        let total: Decimal = executions
            .iter()
            .map(|e| e.price * Decimal::from(e.qty))
            .sum();
        assert_eq!(total, dec!(6020));

        assert_eq!(engine.order(&buy.id).unwrap().remaining(), 0);
        let depth = engine.depth("AAPL");
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(depth.asks[0].qty, 10);
    }

    #[test]
    fn test_placed_event_precedes_nothing_on_reject() {
        let bus = EventBus::new();
        let engine = MatchingEngine::new(bus.clone());
        let mut sub = bus.subscribe(EventFilter::all());

        let _ = engine.admit(order("AAPL", Side::Buy, -5, dec!(1)));
        assert!(sub.try_recv().is_none());

        engine.admit(order("AAPL", Side::Buy, 5, dec!(1))).unwrap();
        match sub.try_recv().unwrap() {
            Event::Market(e) => assert_eq!(e.kind.to_string(), "ORDER_PLACED"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_depth_excludes_terminal_orders() {
        let engine = engine();
        let sell = order("AAPL", Side::Sell, 10, dec!(150));
        engine.admit(sell.clone()).unwrap();
        engine.admit(order("AAPL", Side::Buy, 10, dec!(150))).unwrap();

        let depth = engine.depth("AAPL");
        assert!(depth.bids.is_empty());
        assert!(depth.asks.is_empty());
    }
}
