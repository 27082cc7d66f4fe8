//! Portfolio Store
//!
//! Owns investors, balances, holdings and the transaction log. Writes
//! touching an investor run inside a store transaction; the settlement
//! coordinator reuses the transactional primitives here to apply both legs
//! of an execution atomically.

use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{decimal_from_text, Database};
use crate::error::{CoreError, CoreResult};
use crate::models::event::{AccountEvent, Event, EventKind};
use crate::models::investor::{
    Holding, Investor, Portfolio, PortfolioPosition, Transaction as LedgerEntry,
};
use crate::models::order::Side;
use crate::services::events::EventBus;

pub struct PortfolioStore {
    db: Database,
    bus: EventBus,
}

impl PortfolioStore {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self { db, bus }
    }

    // ========================================================================
    // Investors
    // ========================================================================

    /// Register a new investor. The email must be unused.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        initial_balance: Decimal,
    ) -> CoreResult<Investor> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("name must not be empty".to_string()));
        }
        if !email.contains('@') {
            return Err(CoreError::Validation(format!("invalid email: {}", email)));
        }
        if initial_balance < Decimal::ZERO {
            return Err(CoreError::Validation(
                "initial balance must not be negative".to_string(),
            ));
        }

        let investor = Investor {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            email: email.trim().to_lowercase(),
            balance: initial_balance,
            created_at: Utc::now().timestamp_millis(),
        };

        let result = sqlx::query(
            "INSERT INTO investors (id, name, email, balance, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(investor.id.to_string())
        .bind(&investor.name)
        .bind(&investor.email)
        .bind(investor.balance.to_string())
        .bind(investor.created_at)
        .execute(&self.db.pool)
        .await;

        match result {
            Ok(_) => {
                info!(investor = %investor.id, email = %investor.email, "investor registered");
                Ok(investor)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(CoreError::Conflict(
                format!("email taken: {}", investor.email),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Investor> {
        let row: Option<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, name, email, balance, created_at FROM investors WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await?;

        let (_, name, email, balance, created_at) =
            row.ok_or_else(|| CoreError::NotFound(format!("unknown investor: {}", id)))?;

        Ok(Investor {
            id,
            name,
            email,
            balance: decimal_from_text(&balance)?,
            created_at,
        })
    }

    /// Apply a signed cash adjustment. The balance can never go negative.
    pub async fn adjust_balance(
        &self,
        id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> CoreResult<Investor> {
        let mut tx = self.db.pool.begin().await?;
        let new_balance = Self::shift_balance(&mut tx, id, amount).await?;
        tx.commit().await?;

        debug!(investor = %id, %amount, reason, "balance adjusted");
        self.bus.publish(Event::Account(AccountEvent {
            kind: EventKind::BalanceUpdated,
            investor: id,
            symbol: None,
            amount: new_balance,
            ts: Utc::now().timestamp_millis(),
        }));

        self.get(id).await
    }

    /// Read-modify-write of one balance inside an open transaction
    async fn shift_balance(
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
        amount: Decimal,
    ) -> CoreResult<Decimal> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT balance FROM investors WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&mut **tx)
                .await?;

        let balance = decimal_from_text(
            &row.ok_or_else(|| CoreError::NotFound(format!("unknown investor: {}", id)))?
                .0,
        )?;

        let new_balance = balance + amount;
        if new_balance < Decimal::ZERO {
            return Err(CoreError::InsufficientFunds(format!(
                "balance {} cannot cover {}",
                balance, -amount
            )));
        }

        sqlx::query("UPDATE investors SET balance = ? WHERE id = ?")
            .bind(new_balance.to_string())
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(new_balance)
    }

    // ========================================================================
    // Holdings and trades
    // ========================================================================

    pub async fn holdings(&self, investor: Uuid) -> CoreResult<Vec<Holding>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT symbol, qty, avg_price FROM portfolio WHERE investor = ? ORDER BY symbol",
        )
        .bind(investor.to_string())
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter()
            .map(|(symbol, qty, avg_price)| {
                Ok(Holding {
                    investor,
                    symbol,
                    qty,
                    avg_price: decimal_from_text(&avg_price)?,
                })
            })
            .collect()
    }

    pub async fn held_qty(&self, investor: Uuid, symbol: &str) -> CoreResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT qty FROM portfolio WHERE investor = ? AND symbol = ?")
                .bind(investor.to_string())
                .bind(symbol)
                .fetch_optional(&self.db.pool)
                .await?;
        Ok(row.map(|(qty,)| qty).unwrap_or(0))
    }

    /// Holdings decorated with market value and unrealized P&L against the
    /// supplied quotes
    pub async fn portfolio(
        &self,
        investor: Uuid,
        current_prices: &HashMap<String, Decimal>,
    ) -> CoreResult<Portfolio> {
        let record = self.get(investor).await?;
        let holdings = self.holdings(investor).await?;

        let positions: Vec<PortfolioPosition> = holdings
            .into_iter()
            .map(|h| {
                let current_price = current_prices
                    .get(&h.symbol)
                    .copied()
                    .unwrap_or(h.avg_price);
                let qty = Decimal::from(h.qty);
                PortfolioPosition {
                    symbol: h.symbol,
                    qty: h.qty,
                    avg_price: h.avg_price,
                    current_price,
                    current_value: current_price * qty,
                    profit_loss: (current_price - h.avg_price) * qty,
                }
            })
            .collect();

        let total_value =
            record.balance + positions.iter().map(|p| p.current_value).sum::<Decimal>();

        Ok(Portfolio {
            investor,
            balance: record.balance,
            positions,
            total_value,
        })
    }

    /// Apply one settled trade leg in its own transaction.
    /// Positive `signed_qty` buys, negative sells. Idempotent on `tx_id`.
    pub async fn apply_trade(
        &self,
        investor: Uuid,
        symbol: &str,
        signed_qty: i64,
        price: Decimal,
        tx_id: Uuid,
    ) -> CoreResult<()> {
        let mut tx = self.db.pool.begin().await?;
        let events = self
            .apply_trade_in(&mut tx, investor, symbol, signed_qty, price, tx_id)
            .await?;
        tx.commit().await?;
        for event in events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Transactional body of [`apply_trade`](Self::apply_trade). The
    /// settlement coordinator calls this twice (buyer leg, seller leg) inside
    /// one store transaction so both legs apply or neither does. Returns the
    /// events to publish after commit.
    pub(crate) async fn apply_trade_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        investor: Uuid,
        symbol: &str,
        signed_qty: i64,
        price: Decimal,
        tx_id: Uuid,
    ) -> CoreResult<Vec<Event>> {
        if signed_qty == 0 {
            return Err(CoreError::Validation("qty must not be zero".to_string()));
        }
        if price < Decimal::ZERO {
            return Err(CoreError::Validation(
                "price must not be negative".to_string(),
            ));
        }

        // Idempotency: a leg already recorded under this tx id is done.
        let seen: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM transactions WHERE id = ?")
                .bind(tx_id.to_string())
                .fetch_optional(&mut **tx)
                .await?;
        if seen.is_some() {
            debug!(tx_id = %tx_id, "trade leg already applied, skipping");
            return Ok(Vec::new());
        }

        let qty = signed_qty.unsigned_abs() as i64;
        let notional = Decimal::from(qty) * price;
        let side = if signed_qty > 0 { Side::Buy } else { Side::Sell };

        let new_balance = match side {
            Side::Buy => {
                let balance = Self::shift_balance(tx, investor, -notional).await?;
                self.upsert_holding_buy(tx, investor, symbol, qty, price)
                    .await?;
                balance
            }
            Side::Sell => {
                self.reduce_holding(tx, investor, symbol, qty).await?;
                Self::shift_balance(tx, investor, notional).await?
            }
        };

        let ts = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO transactions (id, investor, symbol, side, qty, price, total, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tx_id.to_string())
        .bind(investor.to_string())
        .bind(symbol)
        .bind(side.to_string())
        .bind(qty)
        .bind(price.to_string())
        .bind(notional.to_string())
        .bind(ts)
        .execute(&mut **tx)
        .await?;

        Ok(vec![
            Event::Account(AccountEvent {
                kind: EventKind::NewTransaction,
                investor,
                symbol: Some(symbol.to_string()),
                amount: notional,
                ts,
            }),
            Event::Account(AccountEvent {
                kind: EventKind::BalanceUpdated,
                investor,
                symbol: None,
                amount: new_balance,
                ts,
            }),
        ])
    }

    /// Weighted-average upsert for a buy:
    /// `avg' = (oldQty*oldAvg + qty*price) / (oldQty + qty)`
    async fn upsert_holding_buy(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        investor: Uuid,
        symbol: &str,
        qty: i64,
        price: Decimal,
    ) -> CoreResult<()> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT qty, avg_price FROM portfolio WHERE investor = ? AND symbol = ?",
        )
        .bind(investor.to_string())
        .bind(symbol)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some((old_qty, old_avg)) => {
                let old_avg = decimal_from_text(&old_avg)?;
                let new_qty = old_qty + qty;
                let new_avg = (Decimal::from(old_qty) * old_avg
                    + Decimal::from(qty) * price)
                    / Decimal::from(new_qty);
                sqlx::query(
                    "UPDATE portfolio SET qty = ?, avg_price = ? WHERE investor = ? AND symbol = ?",
                )
                .bind(new_qty)
                .bind(new_avg.to_string())
                .bind(investor.to_string())
                .bind(symbol)
                .execute(&mut **tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO portfolio (investor, symbol, qty, avg_price) VALUES (?, ?, ?, ?)",
                )
                .bind(investor.to_string())
                .bind(symbol)
                .bind(qty)
                .bind(price.to_string())
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    /// Decrement a holding for a sell; the row is deleted at zero. The
    /// average price never changes on the way down.
    async fn reduce_holding(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        investor: Uuid,
        symbol: &str,
        qty: i64,
    ) -> CoreResult<()> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT qty FROM portfolio WHERE investor = ? AND symbol = ?",
        )
        .bind(investor.to_string())
        .bind(symbol)
        .fetch_optional(&mut **tx)
        .await?;

        let held = row.map(|(q,)| q).unwrap_or(0);
        if held < qty {
            return Err(CoreError::InsufficientShares(format!(
                "holding {} of {} cannot cover {}",
                held, symbol, qty
            )));
        }

        let remaining = held - qty;
        if remaining == 0 {
            sqlx::query("DELETE FROM portfolio WHERE investor = ? AND symbol = ?")
                .bind(investor.to_string())
                .bind(symbol)
                .execute(&mut **tx)
                .await?;
        } else {
            sqlx::query("UPDATE portfolio SET qty = ? WHERE investor = ? AND symbol = ?")
                .bind(remaining)
                .bind(investor.to_string())
                .bind(symbol)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Pre-trade validation
    // ========================================================================

    /// Pre-trade affordability / availability check. Never mutates.
    pub async fn validate_order(
        &self,
        investor: Uuid,
        symbol: &str,
        side: Side,
        qty: i64,
        price: Decimal,
    ) -> CoreResult<()> {
        if qty <= 0 {
            return Err(CoreError::Validation("qty must be positive".to_string()));
        }

        match side {
            Side::Buy => {
                let record = self.get(investor).await?;
                let cost = Decimal::from(qty) * price;
                if record.balance < cost {
                    return Err(CoreError::InsufficientFunds(format!(
                        "balance {} cannot cover {}",
                        record.balance, cost
                    )));
                }
            }
            Side::Sell => {
                // Existence check first so unknown investors surface as such
                self.get(investor).await?;
                let held = self.held_qty(investor, symbol).await?;
                if held < qty {
                    return Err(CoreError::InsufficientShares(format!(
                        "holding {} of {} cannot cover {}",
                        held, symbol, qty
                    )));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transaction history
    // ========================================================================

    /// Transaction history, newest first
    pub async fn transactions(
        &self,
        investor: Uuid,
        limit: usize,
        start: Option<i64>,
        end: Option<i64>,
    ) -> CoreResult<Vec<LedgerEntry>> {
        let rows: Vec<(String, String, String, i64, String, String, i64)> = sqlx::query_as(
            "SELECT id, symbol, side, qty, price, total, ts FROM transactions
             WHERE investor = ? AND ts >= ? AND ts <= ?
             ORDER BY ts DESC LIMIT ?",
        )
        .bind(investor.to_string())
        .bind(start.unwrap_or(0))
        .bind(end.unwrap_or(i64::MAX))
        .bind(limit as i64)
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter()
            .map(|(id, symbol, side, qty, price, total, ts)| {
                Ok(LedgerEntry {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| CoreError::internal(format!("bad id in store: {}", e)))?,
                    investor,
                    symbol,
                    side: side
                        .parse()
                        .map_err(|e: String| CoreError::internal(e))?,
                    qty,
                    price: decimal_from_text(&price)?,
                    total: decimal_from_text(&total)?,
                    ts,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn store() -> PortfolioStore {
        let db = Database::connect_ephemeral().await.unwrap();
        PortfolioStore::new(db, EventBus::new())
    }

    #[tokio::test]
    async fn test_register_then_get_round_trip() {
        let store = store().await;
        let investor = store
            .register("Alice", "alice@example.com", dec!(10000))
            .await
            .unwrap();

        let fetched = store.get(investor.id).await.unwrap();
        assert_eq!(fetched.name, "Alice");
        assert_eq!(fetched.email, "alice@example.com");
        assert_eq!(fetched.balance, dec!(10000));
        assert_eq!(fetched.created_at, investor.created_at);
    }

    #[tokio::test]
    async fn test_register_email_taken() {
        let store = store().await;
        store
            .register("Alice", "alice@example.com", dec!(100))
            .await
            .unwrap();
        let err = store
            .register("Other", "alice@example.com", dec!(100))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_get_unknown_investor() {
        let store = store().await;
        assert_eq!(
            store.get(Uuid::new_v4()).await.unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_adjust_balance_floor() {
        let store = store().await;
        let investor = store
            .register("Bob", "bob@example.com", dec!(100))
            .await
            .unwrap();

        let updated = store
            .adjust_balance(investor.id, dec!(-60), "withdrawal")
            .await
            .unwrap();
        assert_eq!(updated.balance, dec!(40));

        let err = store
            .adjust_balance(investor.id, dec!(-60), "withdrawal")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(store.get(investor.id).await.unwrap().balance, dec!(40));
    }

    #[tokio::test]
    async fn test_buy_creates_weighted_average_holding() {
        let store = store().await;
        let investor = store
            .register("Carol", "carol@example.com", dec!(100000))
            .await
            .unwrap();

        store
            .apply_trade(investor.id, "AAPL", 10, dec!(100), Uuid::new_v4())
            .await
            .unwrap();
        store
            .apply_trade(investor.id, "AAPL", 10, dec!(200), Uuid::new_v4())
            .await
            .unwrap();

        let holdings = store.holdings(investor.id).await.unwrap();
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].qty, 20);
        // (10*100 + 10*200) / 20
        assert_eq!(holdings[0].avg_price, dec!(150));
        assert_eq!(
            store.get(investor.id).await.unwrap().balance,
            dec!(100000) - dec!(3000)
        );
    }

    #[tokio::test]
    async fn test_sell_keeps_avg_and_deletes_at_zero() {
        let store = store().await;
        let investor = store
            .register("Dave", "dave@example.com", dec!(10000))
            .await
            .unwrap();

        store
            .apply_trade(investor.id, "AAPL", 10, dec!(140), Uuid::new_v4())
            .await
            .unwrap();
        store
            .apply_trade(investor.id, "AAPL", -4, dec!(150), Uuid::new_v4())
            .await
            .unwrap();

        let holdings = store.holdings(investor.id).await.unwrap();
        assert_eq!(holdings[0].qty, 6);
        assert_eq!(holdings[0].avg_price, dec!(140));

        store
            .apply_trade(investor.id, "AAPL", -6, dec!(150), Uuid::new_v4())
            .await
            .unwrap();
        assert!(store.holdings(investor.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_buy_then_sell_round_trip_is_neutral() {
        let store = store().await;
        let investor = store
            .register("Eve", "eve@example.com", dec!(5000))
            .await
            .unwrap();

        store
            .apply_trade(investor.id, "AAPL", 10, dec!(150), Uuid::new_v4())
            .await
            .unwrap();
        store
            .apply_trade(investor.id, "AAPL", -10, dec!(150), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(store.get(investor.id).await.unwrap().balance, dec!(5000));
        assert!(store.holdings(investor.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_trade_is_idempotent_on_tx_id() {
        let store = store().await;
        let investor = store
            .register("Frank", "frank@example.com", dec!(10000))
            .await
            .unwrap();

        let tx_id = Uuid::new_v4();
        store
            .apply_trade(investor.id, "AAPL", 10, dec!(100), tx_id)
            .await
            .unwrap();
        store
            .apply_trade(investor.id, "AAPL", 10, dec!(100), tx_id)
            .await
            .unwrap();

        assert_eq!(store.get(investor.id).await.unwrap().balance, dec!(9000));
        assert_eq!(store.held_qty(investor.id, "AAPL").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_sell_without_shares_fails() {
        let store = store().await;
        let investor = store
            .register("Grace", "grace@example.com", dec!(1000))
            .await
            .unwrap();

        let err = store
            .apply_trade(investor.id, "AAPL", -5, dec!(100), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_SHARES");
        // Nothing moved
        assert_eq!(store.get(investor.id).await.unwrap().balance, dec!(1000));
        assert!(store
            .transactions(investor.id, 10, None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_validate_order_checks() {
        let store = store().await;
        let investor = store
            .register("Henry", "henry@example.com", dec!(100))
            .await
            .unwrap();

        let err = store
            .validate_order(investor.id, "AAPL", Side::Buy, 10, dec!(150))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");

        store
            .validate_order(investor.id, "AAPL", Side::Buy, 1, dec!(99))
            .await
            .unwrap();

        let err = store
            .validate_order(investor.id, "AAPL", Side::Sell, 1, dec!(99))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_SHARES");

        let err = store
            .validate_order(Uuid::new_v4(), "AAPL", Side::Buy, 1, dec!(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_transactions_newest_first_with_window() {
        let store = store().await;
        let investor = store
            .register("Iris", "iris@example.com", dec!(100000))
            .await
            .unwrap();

        for i in 0..3 {
            store
                .apply_trade(investor.id, "AAPL", 1, dec!(100) + Decimal::from(i), Uuid::new_v4())
                .await
                .unwrap();
        }

        let entries = store.transactions(investor.id, 10, None, None).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].ts >= w[1].ts));
        assert_eq!(entries[0].price, dec!(102));

        let limited = store.transactions(investor.id, 2, None, None).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_portfolio_decoration() {
        let store = store().await;
        let investor = store
            .register("Judy", "judy@example.com", dec!(10000))
            .await
            .unwrap();
        store
            .apply_trade(investor.id, "AAPL", 10, dec!(150), Uuid::new_v4())
            .await
            .unwrap();

        let mut prices = HashMap::new();
        prices.insert("AAPL".to_string(), dec!(160));

        let portfolio = store.portfolio(investor.id, &prices).await.unwrap();
        assert_eq!(portfolio.balance, dec!(8500));
        assert_eq!(portfolio.positions.len(), 1);
        assert_eq!(portfolio.positions[0].current_value, dec!(1600));
        assert_eq!(portfolio.positions[0].profit_loss, dec!(100));
        assert_eq!(portfolio.total_value, dec!(10100));
    }
}
