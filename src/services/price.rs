//! Price Engine
//!
//! Owns the per-symbol quote state (current, OHLC, volume) and the price
//! history. Prices are synthetic: each settled execution (and each resting
//! order, at reduced weight) nudges the quote as a function of size and
//! direction. Mutations for a symbol are serialized; reads take a snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StockSeed;
use crate::db::{decimal_from_text, Database};
use crate::error::{CoreError, CoreResult};
use crate::models::event::{Event, EventKind, PriceEvent};
use crate::models::stock::{PricePoint, StockQuote};
use crate::services::events::EventBus;

/// Hard floor for any quote
const PRICE_FLOOR: &str = "0.01";

/// Reduced weight applied when a resting order shows book pressure without
/// trading
pub const BOOK_PRESSURE_IMPACT: f64 = 0.3;

/// Full weight applied on settlement
pub const SETTLEMENT_IMPACT: f64 = 1.0;

pub struct PriceEngine {
    /// Authoritative quote state; one lock per symbol so mutations are
    /// serialized while other symbols proceed in parallel
    stocks: DashMap<String, Arc<Mutex<StockQuote>>>,
    db: Database,
    bus: EventBus,
    volatility: f64,
    alert_pct: f64,
}

impl PriceEngine {
    pub fn new(db: Database, bus: EventBus, volatility: f64, alert_pct: f64) -> Self {
        Self {
            stocks: DashMap::new(),
            db,
            bus,
            volatility,
            alert_pct,
        }
    }

    fn floor() -> Decimal {
        // Constant literal, cannot fail
        PRICE_FLOOR.parse().unwrap_or(Decimal::ZERO)
    }

    /// Bring persisted quotes back into memory, then create any configured
    /// stock that is still missing
    pub async fn seed(&self, seeds: &[StockSeed]) -> CoreResult<()> {
        let rows: Vec<(String, String, String, String, String, String, i64, i64)> =
            sqlx::query_as(
                "SELECT symbol, name, current, open, high, low, volume, last_updated FROM stocks",
            )
            .fetch_all(&self.db.pool)
            .await?;

        for (symbol, name, current, open, high, low, volume, last_updated) in rows {
            let quote = StockQuote {
                symbol: symbol.clone(),
                name,
                current: decimal_from_text(&current)?,
                open: decimal_from_text(&open)?,
                high: decimal_from_text(&high)?,
                low: decimal_from_text(&low)?,
                volume,
                last_updated,
            };
            self.stocks.insert(symbol, Arc::new(Mutex::new(quote)));
        }

        for seed in seeds {
            if !self.stocks.contains_key(&seed.symbol) {
                self.initialize_stock(&seed.symbol, &seed.name, seed.price)
                    .await?;
            }
        }

        info!(count = self.stocks.len(), "price engine seeded");
        Ok(())
    }

    /// Create a new stock with `open = high = low = current = price`
    pub async fn initialize_stock(
        &self,
        symbol: &str,
        name: &str,
        price: Decimal,
    ) -> CoreResult<StockQuote> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(CoreError::Validation("symbol must not be empty".to_string()));
        }
        if price < Self::floor() {
            return Err(CoreError::Validation(format!(
                "price must be at least {}",
                PRICE_FLOOR
            )));
        }
        if self.stocks.contains_key(&symbol) {
            return Err(CoreError::Conflict(format!(
                "stock already initialized: {}",
                symbol
            )));
        }

        let now = Utc::now().timestamp_millis();
        let quote = StockQuote {
            symbol: symbol.clone(),
            name: name.to_string(),
            current: price,
            open: price,
            high: price,
            low: price,
            volume: 0,
            last_updated: now,
        };

        self.persist_quote(&quote).await?;
        self.append_history(&symbol, price, now).await?;
        self.stocks
            .insert(symbol.clone(), Arc::new(Mutex::new(quote.clone())));

        info!(%symbol, %price, "stock initialized");
        Ok(quote)
    }

    /// Apply flow pressure to a symbol's price.
    ///
    /// `delta = current * volatility * dir * ln(1 + qty/100) * noise * impact`
    /// where `noise` is a ±0.1% jitter. The result never drops below the
    /// floor. Volume accrues only at settlement weight.
    pub async fn apply(
        &self,
        symbol: &str,
        qty: i64,
        is_buy: bool,
        impact_factor: f64,
    ) -> CoreResult<StockQuote> {
        let entry = self
            .stocks
            .get(symbol)
            .ok_or_else(|| CoreError::NotFound(format!("unknown symbol: {}", symbol)))?
            .clone();
        let mut quote = entry.lock().await;

        let current = quote.current.to_f64().unwrap_or(0.0);
        let dir = if is_buy { 1.0 } else { -1.0 };
        let noise = 1.0 + (rand::thread_rng().gen::<f64>() - 0.5) * 0.002;
        let delta =
            current * self.volatility * dir * (1.0 + qty as f64 / 100.0).ln() * noise * impact_factor;

        let next = Decimal::from_f64(current + delta)
            .unwrap_or(quote.current)
            .round_dp(4)
            .max(Self::floor());

        let step_pct = if current > 0.0 {
            (delta / current * 100.0).abs()
        } else {
            0.0
        };

        quote.current = next;
        quote.high = quote.high.max(next);
        quote.low = quote.low.min(next);
        if impact_factor >= SETTLEMENT_IMPACT {
            quote.volume += qty;
        }
        quote.last_updated = quote.last_updated.max(Utc::now().timestamp_millis());

        let snapshot = quote.clone();
        self.persist_quote(&snapshot).await?;
        self.append_history(symbol, snapshot.current, snapshot.last_updated)
            .await?;

        debug!(
            %symbol,
            qty,
            is_buy,
            impact_factor,
            price = %snapshot.current,
            "price applied"
        );

        self.publish_tick(&snapshot, EventKind::PriceUpdate);
        if step_pct >= self.alert_pct {
            warn!(%symbol, step_pct, "price moved past alert threshold");
            self.publish_tick(&snapshot, EventKind::PriceAlert);
        }

        Ok(snapshot)
    }

    /// Manually set a quote (admin surface)
    pub async fn update_price(&self, symbol: &str, price: Decimal) -> CoreResult<StockQuote> {
        if price < Self::floor() {
            return Err(CoreError::Validation(format!(
                "price must be at least {}",
                PRICE_FLOOR
            )));
        }

        let entry = self
            .stocks
            .get(symbol)
            .ok_or_else(|| CoreError::NotFound(format!("unknown symbol: {}", symbol)))?
            .clone();
        let mut quote = entry.lock().await;

        quote.current = price;
        quote.high = quote.high.max(price);
        quote.low = quote.low.min(price);
        quote.last_updated = quote.last_updated.max(Utc::now().timestamp_millis());

        let snapshot = quote.clone();
        self.persist_quote(&snapshot).await?;
        self.append_history(symbol, snapshot.current, snapshot.last_updated)
            .await?;
        self.publish_tick(&snapshot, EventKind::PriceUpdate);

        Ok(snapshot)
    }

    pub async fn get_price(&self, symbol: &str) -> CoreResult<StockQuote> {
        let entry = self
            .stocks
            .get(symbol)
            .ok_or_else(|| CoreError::NotFound(format!("unknown symbol: {}", symbol)))?
            .clone();
        let quote = entry.lock().await;
        Ok(quote.clone())
    }

    pub async fn get_prices(&self) -> Vec<StockQuote> {
        let mut quotes = Vec::with_capacity(self.stocks.len());
        for entry in self.snapshot_entries() {
            let quote = entry.lock().await;
            quotes.push(quote.clone());
        }
        quotes.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        quotes
    }

    /// Current quote per symbol, for portfolio decoration
    pub async fn current_prices(&self) -> HashMap<String, Decimal> {
        let mut prices = HashMap::with_capacity(self.stocks.len());
        for entry in self.snapshot_entries() {
            let quote = entry.lock().await;
            prices.insert(quote.symbol.clone(), quote.current);
        }
        prices
    }

    /// Clone out the per-symbol handles so map shards are never held across
    /// an await
    fn snapshot_entries(&self) -> Vec<Arc<Mutex<StockQuote>>> {
        self.stocks.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.stocks.contains_key(symbol)
    }

    /// Price history, newest first
    pub async fn history(
        &self,
        symbol: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> CoreResult<Vec<PricePoint>> {
        if !self.stocks.contains_key(symbol) {
            return Err(CoreError::NotFound(format!("unknown symbol: {}", symbol)));
        }

        let rows: Vec<(f64, i64)> = sqlx::query_as(
            "SELECT price, ts FROM price_history
             WHERE symbol = ? AND ts >= ? AND ts <= ?
             ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(start.unwrap_or(0))
        .bind(end.unwrap_or(i64::MAX))
        .bind(limit as i64)
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(price, ts)| PricePoint {
                symbol: symbol.to_string(),
                price,
                ts,
            })
            .collect())
    }

    /// On the market-open transition: freeze a new baseline,
    /// `open = high = low = current`, and restart the daily volume
    pub async fn reset_daily(&self) -> CoreResult<()> {
        for entry in self.snapshot_entries() {
            let mut quote = entry.lock().await;
            quote.open = quote.current;
            quote.high = quote.current;
            quote.low = quote.current;
            quote.volume = 0;
            quote.last_updated = quote.last_updated.max(Utc::now().timestamp_millis());
            let snapshot = quote.clone();
            drop(quote);
            self.persist_quote(&snapshot).await?;
        }
        info!("daily price reset done");
        Ok(())
    }

    fn publish_tick(&self, quote: &StockQuote, kind: EventKind) {
        self.bus.publish(Event::Price(PriceEvent {
            kind,
            symbol: quote.symbol.clone(),
            price: quote.current,
            change_pct: quote.change_pct().round_dp(4),
            ts: quote.last_updated,
        }));
    }

    async fn persist_quote(&self, quote: &StockQuote) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO stocks (symbol, name, current, open, high, low, volume, last_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (symbol) DO UPDATE SET
                 name = excluded.name,
                 current = excluded.current,
                 open = excluded.open,
                 high = excluded.high,
                 low = excluded.low,
                 volume = excluded.volume,
                 last_updated = excluded.last_updated",
        )
        .bind(&quote.symbol)
        .bind(&quote.name)
        .bind(quote.current.to_string())
        .bind(quote.open.to_string())
        .bind(quote.high.to_string())
        .bind(quote.low.to_string())
        .bind(quote.volume)
        .bind(quote.last_updated)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn append_history(&self, symbol: &str, price: Decimal, ts: i64) -> CoreResult<()> {
        sqlx::query("INSERT INTO price_history (symbol, price, ts) VALUES (?, ?, ?)")
            .bind(symbol)
            .bind(price.to_f64().unwrap_or(0.0))
            .bind(ts)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::EventFilter;
    use rust_decimal_macros::dec;

    async fn engine() -> (PriceEngine, EventBus) {
        let db = Database::connect_ephemeral().await.unwrap();
        let bus = EventBus::new();
        (PriceEngine::new(db, bus.clone(), 0.001, 5.0), bus)
    }

    #[tokio::test]
    async fn test_initialize_and_get() {
        let (engine, _) = engine().await;
        engine
            .initialize_stock("aapl", "Apple Inc", dec!(150))
            .await
            .unwrap();

        let quote = engine.get_price("AAPL").await.unwrap();
        assert_eq!(quote.current, dec!(150));
        assert_eq!(quote.open, dec!(150));
        assert_eq!(quote.high, dec!(150));
        assert_eq!(quote.low, dec!(150));
        assert_eq!(quote.volume, 0);

        assert_eq!(
            engine
                .initialize_stock("AAPL", "Apple Inc", dec!(150))
                .await
                .unwrap_err()
                .code(),
            "CONFLICT"
        );
        assert_eq!(
            engine.get_price("NOPE").await.unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_buy_pressure_moves_price_up() {
        let (engine, _) = engine().await;
        engine
            .initialize_stock("AAPL", "Apple Inc", dec!(150))
            .await
            .unwrap();

        let quote = engine.apply("AAPL", 100, true, SETTLEMENT_IMPACT).await.unwrap();
        assert!(quote.current > dec!(150));
        assert_eq!(quote.high, quote.current);
        assert_eq!(quote.low, dec!(150));
        assert_eq!(quote.volume, 100);
        // Open is frozen until the daily reset
        assert_eq!(quote.open, dec!(150));
    }

    #[tokio::test]
    async fn test_sell_pressure_moves_price_down() {
        let (engine, _) = engine().await;
        engine
            .initialize_stock("AAPL", "Apple Inc", dec!(150))
            .await
            .unwrap();

        let quote = engine.apply("AAPL", 100, false, SETTLEMENT_IMPACT).await.unwrap();
        assert!(quote.current < dec!(150));
        assert_eq!(quote.low, quote.current);
    }

    #[tokio::test]
    async fn test_price_floor_holds() {
        // Volatility of 1.0 makes a large sell overshoot the floor
        let db = Database::connect_ephemeral().await.unwrap();
        let engine = PriceEngine::new(db, EventBus::new(), 1.0, 100.0);
        engine
            .initialize_stock("PENNY", "Penny Stock", dec!(0.02))
            .await
            .unwrap();

        for _ in 0..5 {
            engine
                .apply("PENNY", 100_000, false, SETTLEMENT_IMPACT)
                .await
                .unwrap();
        }
        let quote = engine.get_price("PENNY").await.unwrap();
        assert!(quote.current >= dec!(0.01));
    }

    #[tokio::test]
    async fn test_book_pressure_skips_volume() {
        let (engine, _) = engine().await;
        engine
            .initialize_stock("AAPL", "Apple Inc", dec!(150))
            .await
            .unwrap();

        let quote = engine
            .apply("AAPL", 100, true, BOOK_PRESSURE_IMPACT)
            .await
            .unwrap();
        assert_eq!(quote.volume, 0);
        assert!(quote.current > dec!(150));
    }

    #[tokio::test]
    async fn test_apply_publishes_price_update() {
        let (engine, bus) = engine().await;
        engine
            .initialize_stock("AAPL", "Apple Inc", dec!(150))
            .await
            .unwrap();

        let mut sub = bus.subscribe(EventFilter::for_kinds([EventKind::PriceUpdate]));
        engine.apply("AAPL", 10, true, SETTLEMENT_IMPACT).await.unwrap();

        match sub.try_recv().unwrap() {
            Event::Price(e) => {
                assert_eq!(e.kind, EventKind::PriceUpdate);
                assert_eq!(e.symbol, "AAPL");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_daily_reset() {
        let (engine, _) = engine().await;
        engine
            .initialize_stock("AAPL", "Apple Inc", dec!(150))
            .await
            .unwrap();
        engine.apply("AAPL", 500, true, SETTLEMENT_IMPACT).await.unwrap();

        engine.reset_daily().await.unwrap();
        let quote = engine.get_price("AAPL").await.unwrap();
        assert_eq!(quote.open, quote.current);
        assert_eq!(quote.high, quote.current);
        assert_eq!(quote.low, quote.current);
        assert_eq!(quote.volume, 0);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let (engine, _) = engine().await;
        engine
            .initialize_stock("AAPL", "Apple Inc", dec!(150))
            .await
            .unwrap();
        for _ in 0..5 {
            engine.apply("AAPL", 10, true, SETTLEMENT_IMPACT).await.unwrap();
        }

        let history = engine.history("AAPL", None, None, 100).await.unwrap();
        // Initial point plus five applies
        assert_eq!(history.len(), 6);
        assert!(history.windows(2).all(|w| w[0].ts >= w[1].ts));

        let limited = engine.history("AAPL", None, None, 3).await.unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[tokio::test]
    async fn test_update_price_validates_floor() {
        let (engine, _) = engine().await;
        engine
            .initialize_stock("AAPL", "Apple Inc", dec!(150))
            .await
            .unwrap();

        assert_eq!(
            engine
                .update_price("AAPL", dec!(0.001))
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );

        let quote = engine.update_price("AAPL", dec!(170)).await.unwrap();
        assert_eq!(quote.current, dec!(170));
        assert_eq!(quote.high, dec!(170));
    }

    #[tokio::test]
    async fn test_seed_restores_persisted_state() {
        let db = Database::connect_ephemeral().await.unwrap();
        let bus = EventBus::new();
        let engine = PriceEngine::new(db.clone(), bus.clone(), 0.001, 5.0);
        let seeds = vec![StockSeed {
            symbol: "AAPL".to_string(),
            price: dec!(150),
            name: "Apple Inc".to_string(),
        }];
        engine.seed(&seeds).await.unwrap();
        engine.apply("AAPL", 100, true, SETTLEMENT_IMPACT).await.unwrap();
        let moved = engine.get_price("AAPL").await.unwrap();

        // A fresh engine over the same store sees the moved price, not the seed
        let engine2 = PriceEngine::new(db, bus, 0.001, 5.0);
        engine2.seed(&seeds).await.unwrap();
        let quote = engine2.get_price("AAPL").await.unwrap();
        assert_eq!(quote.current, moved.current);
        assert_eq!(quote.volume, 100);
    }
}
