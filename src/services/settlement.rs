//! Settlement Coordinator
//!
//! Applies every downstream effect of an execution: both portfolio legs,
//! the price impact, the analytics record and the `ORDER_EXECUTED` events.
//! The two portfolio legs and the audit row commit in one store transaction
//! so they apply together or not at all. Store errors are retried with the
//! execution id as the idempotency key; a leg that cannot apply marks the
//! execution `failed` and publishes a compensation notice instead of
//! leaving half a trade behind.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::models::event::{Event, MarketEvent, SettlementFailedNotice};
use crate::models::order::{Execution, Side};
use crate::services::analytics::AnalyticsRecorder;
use crate::services::events::EventBus;
use crate::services::portfolio::PortfolioStore;
use crate::services::price::{PriceEngine, SETTLEMENT_IMPACT};

const STORE_RETRIES: u32 = 3;

pub struct SettlementCoordinator {
    db: Database,
    portfolio: Arc<PortfolioStore>,
    price: Arc<PriceEngine>,
    analytics: Arc<AnalyticsRecorder>,
    bus: EventBus,
}

impl SettlementCoordinator {
    pub fn new(
        db: Database,
        portfolio: Arc<PortfolioStore>,
        price: Arc<PriceEngine>,
        analytics: Arc<AnalyticsRecorder>,
        bus: EventBus,
    ) -> Self {
        Self {
            db,
            portfolio,
            price,
            analytics,
            bus,
        }
    }

    /// Settle one execution to completion. Idempotent: an execution already
    /// marked settled is a no-op.
    pub async fn settle(&self, execution: &Execution) -> CoreResult<()> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT settlement_status FROM executions WHERE id = ?")
                .bind(execution.id.to_string())
                .fetch_optional(&self.db.pool)
                .await?;
        if let Some((status,)) = &existing {
            if status == "settled" {
                return Ok(());
            }
        }

        // Both counterparty legs, atomically. Store-level errors retry;
        // domain errors (funds, shares) never do.
        let mut events = None;
        for attempt in 1..=STORE_RETRIES {
            match self.apply_legs(execution).await {
                Ok(applied) => {
                    events = Some(applied);
                    break;
                }
                Err(CoreError::Internal(reason)) if attempt < STORE_RETRIES => {
                    warn!(
                        execution = %execution.id,
                        attempt,
                        "store error during settlement, retrying: {}",
                        reason
                    );
                }
                Err(e) => {
                    return self.fail(execution, e).await;
                }
            }
        }
        let events = match events {
            Some(events) => events,
            None => {
                return self
                    .fail(execution, CoreError::internal("settlement retries exhausted"))
                    .await;
            }
        };

        for event in events {
            self.bus.publish(event);
        }

        // Price impact, directed by the aggressor
        let is_buy = execution.aggressor == Side::Buy;
        if let Err(e) = self
            .price
            .apply(&execution.symbol, execution.qty, is_buy, SETTLEMENT_IMPACT)
            .await
        {
            return self.fail(execution, e).await;
        }

        // Analytics log, from both perspectives
        if let Err(e) = self.analytics.record(execution).await {
            return self.fail(execution, e).await;
        }

        self.bus.publish(Event::Market(MarketEvent::executed(
            execution,
            Side::Buy,
        )));
        self.bus.publish(Event::Market(MarketEvent::executed(
            execution,
            Side::Sell,
        )));

        info!(
            execution = %execution.id,
            symbol = %execution.symbol,
            qty = execution.qty,
            price = %execution.price,
            "execution settled"
        );
        Ok(())
    }

    /// Buyer leg, seller leg and the audit row in a single transaction
    async fn apply_legs(&self, execution: &Execution) -> CoreResult<Vec<Event>> {
        let mut tx = self.db.pool.begin().await?;

        let buyer_tx = Uuid::new_v5(&execution.id, b"buyer-leg");
        let seller_tx = Uuid::new_v5(&execution.id, b"seller-leg");

        let mut events = self
            .portfolio
            .apply_trade_in(
                &mut tx,
                execution.buyer,
                &execution.symbol,
                execution.qty,
                execution.price,
                buyer_tx,
            )
            .await?;
        events.extend(
            self.portfolio
                .apply_trade_in(
                    &mut tx,
                    execution.seller,
                    &execution.symbol,
                    -execution.qty,
                    execution.price,
                    seller_tx,
                )
                .await?,
        );

        self.write_audit_row(&mut tx, execution, "settled").await?;
        tx.commit().await?;
        Ok(events)
    }

    async fn write_audit_row(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        execution: &Execution,
        status: &str,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO executions
                 (id, buy_order_id, sell_order_id, symbol, qty, price, buyer, seller, ts,
                  settlement_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET settlement_status = excluded.settlement_status",
        )
        .bind(execution.id.to_string())
        .bind(execution.buy_order_id.to_string())
        .bind(execution.sell_order_id.to_string())
        .bind(&execution.symbol)
        .bind(execution.qty)
        .bind(execution.price.to_string())
        .bind(execution.buyer.to_string())
        .bind(execution.seller.to_string())
        .bind(execution.ts)
        .bind(status)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Flag the execution, publish the compensation notice and surface the
    /// failure
    async fn fail(&self, execution: &Execution, cause: CoreError) -> CoreResult<()> {
        error!(
            execution = %execution.id,
            symbol = %execution.symbol,
            "settlement failed: {}",
            cause
        );

        let mut tx = self.db.pool.begin().await?;
        self.write_audit_row(&mut tx, execution, "failed").await?;
        tx.commit().await?;

        self.bus
            .publish(Event::SettlementFailed(SettlementFailedNotice::new(
                execution.id,
                execution.symbol.clone(),
                cause.to_string(),
                execution.ts,
            )));

        Err(CoreError::SettlementFailed {
            execution_id: execution.id.to_string(),
            reason: cause.to_string(),
        })
    }

    /// Settlement status of one execution, for the audit surface
    pub async fn status(&self, execution_id: Uuid) -> CoreResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT settlement_status FROM executions WHERE id = ?")
                .bind(execution_id.to_string())
                .fetch_optional(&self.db.pool)
                .await?;
        Ok(row.map(|(status,)| status))
    }
}
