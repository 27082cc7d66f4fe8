//! Analytics Recorder
//!
//! Append-only trade log plus the derived read queries: leaderboards,
//! volatility ranking, market-wide stats, per-investor performance, a toy
//! regression-based price prediction and bucketed volume series.
//!
//! Every execution is recorded from both counterparties' perspectives. The
//! buyer-side row is the canonical one for symbol-level aggregates so an
//! execution is never counted twice; investor-scoped queries use both.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{decimal_from_text, Database};
use crate::error::{CoreError, CoreResult};
use crate::models::event::{AnalyticsEvent, Event, EventKind};
use crate::models::order::{Execution, Side};
use crate::services::events::EventBus;

pub struct AnalyticsRecorder {
    db: Database,
    bus: EventBus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopTradedEntry {
    pub symbol: String,
    pub total_qty: i64,
    pub trade_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolatilityEntry {
    pub symbol: String,
    pub volatility_pct: f64,
    pub high: f64,
    pub low: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketStats {
    pub trades_24h: i64,
    pub volume_24h: i64,
    pub active_investors_24h: i64,
    pub active_symbols_24h: i64,
    /// Mean of (current - open) across all symbols
    pub trend: f64,
    pub sentiment: Sentiment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolPerformance {
    pub symbol: String,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trades: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvestorPerformance {
    pub investor: Uuid,
    pub symbols: Vec<SymbolPerformance>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_trades: i64,
    pub win_rate: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricePrediction {
    pub symbol: String,
    pub current: f64,
    pub predicted: f64,
    pub horizon_min: i64,
    /// R² of the fit, clamped to [0, 100]
    pub confidence: f64,
    pub trend: PredictedTrend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PredictedTrend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeBucket {
    pub ts: i64,
    pub volume: i64,
    pub count: i64,
    pub avg_price: f64,
}

impl AnalyticsRecorder {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self { db, bus }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Record a settled execution from both perspectives. Idempotent on the
    /// execution id.
    pub async fn record(&self, execution: &Execution) -> CoreResult<()> {
        let price = execution
            .price
            .to_f64()
            .ok_or_else(|| CoreError::internal("execution price out of f64 range"))?;

        let legs = [
            (
                Uuid::new_v5(&execution.id, b"trade-buy"),
                execution.buyer,
                Side::Buy,
            ),
            (
                Uuid::new_v5(&execution.id, b"trade-sell"),
                execution.seller,
                Side::Sell,
            ),
        ];

        for (id, investor, side) in legs {
            sqlx::query(
                "INSERT OR IGNORE INTO analytics_trades
                     (id, execution_id, investor, symbol, side, qty, price, ts)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(execution.id.to_string())
            .bind(investor.to_string())
            .bind(&execution.symbol)
            .bind(side.to_string())
            .bind(execution.qty)
            .bind(price)
            .bind(execution.ts)
            .execute(&self.db.pool)
            .await?;
        }

        debug!(execution = %execution.id, symbol = %execution.symbol, "trade recorded");
        Ok(())
    }

    /// Record a standalone trade row (the RPC surface's RecordTrade)
    pub async fn record_trade(
        &self,
        investor: Uuid,
        symbol: &str,
        side: Side,
        qty: i64,
        price: f64,
        ts: Option<i64>,
    ) -> CoreResult<()> {
        if qty <= 0 {
            return Err(CoreError::Validation("qty must be positive".to_string()));
        }
        sqlx::query(
            "INSERT INTO analytics_trades
                 (id, execution_id, investor, symbol, side, qty, price, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(Uuid::nil().to_string())
        .bind(investor.to_string())
        .bind(symbol)
        .bind(side.to_string())
        .bind(qty)
        .bind(price)
        .bind(ts.unwrap_or_else(|| Utc::now().timestamp_millis()))
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Recent trades for one symbol, newest first (buyer-side rows)
    pub async fn recent_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> CoreResult<Vec<(i64, f64, i64)>> {
        let rows: Vec<(i64, f64, i64)> = sqlx::query_as(
            "SELECT qty, price, ts FROM analytics_trades
             WHERE symbol = ? AND side = 'BUY'
             ORDER BY ts DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    // ========================================================================
    // Derived queries
    // ========================================================================

    /// Symbols ranked by traded quantity inside the window, trade count as
    /// the tie-break
    pub async fn top_traded(&self, limit: usize, window_ms: i64) -> CoreResult<Vec<TopTradedEntry>> {
        let since = Utc::now().timestamp_millis() - window_ms;
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT symbol, SUM(qty) AS total_qty, COUNT(*) AS trade_count
             FROM analytics_trades
             WHERE ts >= ? AND side = 'BUY'
             GROUP BY symbol
             ORDER BY total_qty DESC, trade_count DESC
             LIMIT ?",
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(symbol, total_qty, trade_count)| TopTradedEntry {
                symbol,
                total_qty,
                trade_count,
            })
            .collect())
    }

    /// Symbols ranked by `(max - min) / avg * 100` over the window's price
    /// history
    pub async fn most_volatile(
        &self,
        limit: usize,
        window_ms: i64,
    ) -> CoreResult<Vec<VolatilityEntry>> {
        let since = Utc::now().timestamp_millis() - window_ms;
        let rows: Vec<(String, f64, f64, f64)> = sqlx::query_as(
            "SELECT symbol, MAX(price), MIN(price), AVG(price)
             FROM price_history
             WHERE ts >= ?
             GROUP BY symbol",
        )
        .bind(since)
        .fetch_all(&self.db.pool)
        .await?;

        let mut entries: Vec<VolatilityEntry> = rows
            .into_iter()
            .filter(|(_, _, _, avg)| *avg > 0.0)
            .map(|(symbol, high, low, avg)| VolatilityEntry {
                symbol,
                volatility_pct: (high - low) / avg * 100.0,
                high,
                low,
            })
            .collect();

        entries.sort_by(|a, b| {
            b.volatility_pct
                .partial_cmp(&a.volatility_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries.truncate(limit);
        Ok(entries)
    }

    /// Market-wide totals over the last 24 hours plus a breadth trend
    pub async fn market_stats(&self) -> CoreResult<MarketStats> {
        let since = Utc::now().timestamp_millis() - 24 * 60 * 60 * 1000;

        let (trades, volume): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(qty) FROM analytics_trades WHERE ts >= ? AND side = 'BUY'",
        )
        .bind(since)
        .fetch_one(&self.db.pool)
        .await?;

        let (investors,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT investor) FROM analytics_trades WHERE ts >= ?",
        )
        .bind(since)
        .fetch_one(&self.db.pool)
        .await?;

        let (symbols,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT symbol) FROM analytics_trades WHERE ts >= ?",
        )
        .bind(since)
        .fetch_one(&self.db.pool)
        .await?;

        let quotes: Vec<(String, String)> =
            sqlx::query_as("SELECT current, open FROM stocks").fetch_all(&self.db.pool).await?;
        let mut deltas = Vec::with_capacity(quotes.len());
        for (current, open) in quotes {
            let current = decimal_from_text(&current)?.to_f64().unwrap_or(0.0);
            let open = decimal_from_text(&open)?.to_f64().unwrap_or(0.0);
            deltas.push(current - open);
        }
        let trend = if deltas.is_empty() {
            0.0
        } else {
            deltas.iter().sum::<f64>() / deltas.len() as f64
        };

        let sentiment = if trend > 0.5 {
            Sentiment::Bullish
        } else if trend < -0.5 {
            Sentiment::Bearish
        } else {
            Sentiment::Neutral
        };

        Ok(MarketStats {
            trades_24h: trades,
            volume_24h: volume.unwrap_or(0),
            active_investors_24h: investors,
            active_symbols_24h: symbols,
            trend,
            sentiment,
        })
    }

    /// Per-investor realized/unrealized P&L and a coarse risk bucket.
    /// Realized P&L runs average-cost accounting over the chronological
    /// trade sequence per symbol.
    pub async fn investor_performance(&self, investor: Uuid) -> CoreResult<InvestorPerformance> {
        let rows: Vec<(String, String, i64, f64, i64)> = sqlx::query_as(
            "SELECT symbol, side, qty, price, ts FROM analytics_trades
             WHERE investor = ?
             ORDER BY ts ASC, id ASC",
        )
        .bind(investor.to_string())
        .fetch_all(&self.db.pool)
        .await?;

        use std::collections::HashMap;
        struct Running {
            qty: i64,
            avg_cost: f64,
            realized: f64,
            trades: i64,
        }
        let mut per_symbol: HashMap<String, Running> = HashMap::new();
        let mut wins = 0i64;
        let mut losses = 0i64;
        let mut total_trades = 0i64;
        let mut total_notional = 0.0f64;

        for (symbol, side, qty, price, _ts) in rows {
            let side: Side = side.parse().map_err(|e: String| CoreError::internal(e))?;
            let entry = per_symbol.entry(symbol).or_insert(Running {
                qty: 0,
                avg_cost: 0.0,
                realized: 0.0,
                trades: 0,
            });
            entry.trades += 1;
            total_trades += 1;
            total_notional += qty as f64 * price;

            match side {
                Side::Buy => {
                    let new_qty = entry.qty + qty;
                    entry.avg_cost = (entry.qty as f64 * entry.avg_cost + qty as f64 * price)
                        / new_qty as f64;
                    entry.qty = new_qty;
                }
                Side::Sell => {
                    let closed = qty.min(entry.qty);
                    if closed > 0 {
                        let pnl = (price - entry.avg_cost) * closed as f64;
                        entry.realized += pnl;
                        if pnl > 0.0 {
                            wins += 1;
                        } else if pnl < 0.0 {
                            losses += 1;
                        }
                    }
                    entry.qty -= closed;
                }
            }
        }

        // Unrealized P&L from current holdings against current quotes
        let holdings: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT symbol, qty, avg_price FROM portfolio WHERE investor = ?",
        )
        .bind(investor.to_string())
        .fetch_all(&self.db.pool)
        .await?;

        let mut unrealized_by_symbol: HashMap<String, f64> = HashMap::new();
        for (symbol, qty, avg_price) in holdings {
            let avg_price = decimal_from_text(&avg_price)?.to_f64().unwrap_or(0.0);
            let current: Option<(String,)> =
                sqlx::query_as("SELECT current FROM stocks WHERE symbol = ?")
                    .bind(&symbol)
                    .fetch_optional(&self.db.pool)
                    .await?;
            let current = match current {
                Some((text,)) => decimal_from_text(&text)?.to_f64().unwrap_or(avg_price),
                None => avg_price,
            };
            unrealized_by_symbol.insert(symbol, (current - avg_price) * qty as f64);
        }

        let mut symbols: Vec<SymbolPerformance> = per_symbol
            .into_iter()
            .map(|(symbol, running)| {
                let unrealized = unrealized_by_symbol.remove(&symbol).unwrap_or(0.0);
                SymbolPerformance {
                    symbol,
                    realized_pnl: running.realized,
                    unrealized_pnl: unrealized,
                    trades: running.trades,
                }
            })
            .collect();
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let realized_pnl = symbols.iter().map(|s| s.realized_pnl).sum();
        let unrealized_pnl = symbols.iter().map(|s| s.unrealized_pnl).sum::<f64>()
            + unrealized_by_symbol.values().sum::<f64>();

        let win_rate = if wins + losses > 0 {
            wins as f64 / (wins + losses) as f64
        } else {
            0.0
        };

        let avg_trade = if total_trades > 0 {
            total_notional / total_trades as f64
        } else {
            0.0
        };
        let risk_level = if avg_trade >= 10_000.0 || total_trades > 50 {
            RiskLevel::High
        } else if avg_trade >= 5_000.0 || total_trades > 20 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        Ok(InvestorPerformance {
            investor,
            symbols,
            realized_pnl,
            unrealized_pnl,
            total_trades,
            win_rate,
            risk_level,
        })
    }

    /// Extrapolate a linear fit over the last 20 price points
    pub async fn predict_price(&self, symbol: &str, horizon_min: i64) -> CoreResult<PricePrediction> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            "SELECT price FROM price_history WHERE symbol = ? ORDER BY ts DESC, id DESC LIMIT 20",
        )
        .bind(symbol)
        .fetch_all(&self.db.pool)
        .await?;

        if rows.is_empty() {
            return Err(CoreError::NotFound(format!(
                "no price history for symbol: {}",
                symbol
            )));
        }

        // Oldest first for the regression
        let prices: Vec<f64> = rows.into_iter().rev().map(|(p,)| p).collect();
        let current = *prices.last().unwrap_or(&0.0);
        let n = prices.len() as f64;

        let (predicted, confidence) = if prices.len() < 2 {
            (current, 0.0)
        } else {
            let mean_x = (n - 1.0) / 2.0;
            let mean_y = prices.iter().sum::<f64>() / n;

            let mut sxx = 0.0;
            let mut sxy = 0.0;
            for (i, y) in prices.iter().enumerate() {
                let dx = i as f64 - mean_x;
                sxx += dx * dx;
                sxy += dx * (y - mean_y);
            }
            let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
            let intercept = mean_y - slope * mean_x;

            let mut ss_res = 0.0;
            let mut ss_tot = 0.0;
            for (i, y) in prices.iter().enumerate() {
                let fit = intercept + slope * i as f64;
                ss_res += (y - fit) * (y - fit);
                ss_tot += (y - mean_y) * (y - mean_y);
            }
            let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

            let steps = horizon_min as f64 / 60.0;
            let predicted = intercept + slope * (n - 1.0 + steps);
            (predicted.max(0.01), (r2 * 100.0).clamp(0.0, 100.0))
        };

        let trend = if predicted > current * 1.005 {
            PredictedTrend::Up
        } else if predicted < current * 0.995 {
            PredictedTrend::Down
        } else {
            PredictedTrend::Stable
        };

        let prediction = PricePrediction {
            symbol: symbol.to_string(),
            current,
            predicted,
            horizon_min,
            confidence,
            trend,
        };

        self.bus.publish(Event::Analytics(AnalyticsEvent {
            kind: EventKind::PredictionAvailable,
            symbol: Some(symbol.to_string()),
            detail: serde_json::json!({
                "predicted": prediction.predicted,
                "confidence": prediction.confidence,
                "horizon_min": horizon_min,
            }),
            ts: Utc::now().timestamp_millis(),
        }));

        Ok(prediction)
    }

    /// Bucketed trade volume, non-empty buckets only, ascending
    pub async fn trading_volume(
        &self,
        symbol: &str,
        start: Option<i64>,
        end: Option<i64>,
        interval_ms: i64,
    ) -> CoreResult<Vec<VolumeBucket>> {
        if interval_ms <= 0 {
            return Err(CoreError::Validation(
                "interval must be positive".to_string(),
            ));
        }

        let start = start.unwrap_or(0);
        let end = end.unwrap_or_else(|| Utc::now().timestamp_millis());

        let rows: Vec<(i64, f64, i64)> = sqlx::query_as(
            "SELECT qty, price, ts FROM analytics_trades
             WHERE symbol = ? AND side = 'BUY' AND ts >= ? AND ts <= ?
             ORDER BY ts ASC",
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.db.pool)
        .await?;

        use std::collections::BTreeMap;
        struct Acc {
            volume: i64,
            count: i64,
            notional: f64,
        }
        let mut buckets: BTreeMap<i64, Acc> = BTreeMap::new();
        for (qty, price, ts) in rows {
            let bucket_ts = start + ((ts - start) / interval_ms) * interval_ms;
            let acc = buckets.entry(bucket_ts).or_insert(Acc {
                volume: 0,
                count: 0,
                notional: 0.0,
            });
            acc.volume += qty;
            acc.count += 1;
            acc.notional += qty as f64 * price;
        }

        Ok(buckets
            .into_iter()
            .map(|(ts, acc)| VolumeBucket {
                ts,
                volume: acc.volume,
                count: acc.count,
                avg_price: if acc.volume > 0 {
                    acc.notional / acc.volume as f64
                } else {
                    0.0
                },
            })
            .collect())
    }
}

/// Periodically publish the current leaderboard as `TOP_STOCKS_UPDATED`
pub fn spawn_top_stocks_worker(
    recorder: std::sync::Arc<AnalyticsRecorder>,
    bus: EventBus,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("top stocks worker started");
        loop {
            ticker.tick().await;
            match recorder.top_traded(5, 24 * 60 * 60 * 1000).await {
                Ok(entries) if !entries.is_empty() => {
                    let symbols: Vec<String> =
                        entries.iter().map(|e| e.symbol.clone()).collect();
                    bus.publish(Event::Analytics(AnalyticsEvent {
                        kind: EventKind::TopStocksUpdated,
                        symbol: None,
                        detail: serde_json::json!({ "symbols": symbols }),
                        ts: Utc::now().timestamp_millis(),
                    }));
                }
                Ok(_) => {}
                Err(e) => tracing::error!("top stocks query failed: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn recorder() -> AnalyticsRecorder {
        let db = Database::connect_ephemeral().await.unwrap();
        AnalyticsRecorder::new(db, EventBus::new())
    }

    fn execution(symbol: &str, qty: i64, price: Decimal, buyer: Uuid, seller: Uuid) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            qty,
            price,
            buyer,
            seller,
            aggressor: Side::Buy,
            ts: Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let recorder = recorder().await;
        let exec = execution("AAPL", 10, dec!(150), Uuid::new_v4(), Uuid::new_v4());

        recorder.record(&exec).await.unwrap();
        recorder.record(&exec).await.unwrap();

        let top = recorder.top_traded(10, 60_000).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].total_qty, 10);
        assert_eq!(top[0].trade_count, 1);
    }

    #[tokio::test]
    async fn test_top_traded_ranks_by_qty_then_count() {
        let recorder = recorder().await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        recorder.record(&execution("AAPL", 100, dec!(150), a, b)).await.unwrap();
        recorder.record(&execution("GOOG", 60, dec!(2800), a, b)).await.unwrap();
        recorder.record(&execution("GOOG", 40, dec!(2800), a, b)).await.unwrap();
        recorder.record(&execution("TSLA", 100, dec!(250), a, b)).await.unwrap();

        let top = recorder.top_traded(10, 60_000).await.unwrap();
        assert_eq!(top[0].symbol, "GOOG");
        assert_eq!(top[0].total_qty, 100);
        assert_eq!(top[0].trade_count, 2);
        // AAPL and TSLA tie on qty; either order is acceptable on equal count
        assert_eq!(top.len(), 3);
    }

    #[tokio::test]
    async fn test_market_stats_counts_each_execution_once() {
        let recorder = recorder().await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        recorder.record(&execution("AAPL", 10, dec!(150), a, b)).await.unwrap();
        recorder.record(&execution("AAPL", 20, dec!(151), a, b)).await.unwrap();

        let stats = recorder.market_stats().await.unwrap();
        assert_eq!(stats.trades_24h, 2);
        assert_eq!(stats.volume_24h, 30);
        // Both counterparties count as active
        assert_eq!(stats.active_investors_24h, 2);
        assert_eq!(stats.active_symbols_24h, 1);
        assert_eq!(stats.sentiment, Sentiment::Neutral);
    }

    #[tokio::test]
    async fn test_investor_performance_realized_pnl() {
        let recorder = recorder().await;
        let investor = Uuid::new_v4();

        // Buy 10 @ 100, buy 10 @ 200 (avg 150), sell 10 @ 180 -> +300
        recorder
            .record_trade(investor, "AAPL", Side::Buy, 10, 100.0, Some(1))
            .await
            .unwrap();
        recorder
            .record_trade(investor, "AAPL", Side::Buy, 10, 200.0, Some(2))
            .await
            .unwrap();
        recorder
            .record_trade(investor, "AAPL", Side::Sell, 10, 180.0, Some(3))
            .await
            .unwrap();

        let perf = recorder.investor_performance(investor).await.unwrap();
        assert_eq!(perf.total_trades, 3);
        assert!((perf.realized_pnl - 300.0).abs() < 1e-9);
        assert_eq!(perf.win_rate, 1.0);
        assert_eq!(perf.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_risk_level_thresholds() {
        let recorder = recorder().await;
        let investor = Uuid::new_v4();

        // One trade with notional 60000 -> avg trade >= 10000 -> HIGH
        recorder
            .record_trade(investor, "GOOG", Side::Buy, 20, 3000.0, Some(1))
            .await
            .unwrap();
        let perf = recorder.investor_performance(investor).await.unwrap();
        assert_eq!(perf.risk_level, RiskLevel::High);

        // Another investor with modest notional but many trades
        let busy = Uuid::new_v4();
        for i in 0..25 {
            recorder
                .record_trade(busy, "AAPL", Side::Buy, 1, 10.0, Some(i))
                .await
                .unwrap();
        }
        let perf = recorder.investor_performance(busy).await.unwrap();
        assert_eq!(perf.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn test_predict_price_rising_series() {
        let recorder = recorder().await;
        // Strictly linear history: regression should fit perfectly
        for i in 0..20i64 {
            sqlx::query("INSERT INTO price_history (symbol, price, ts) VALUES (?, ?, ?)")
                .bind("AAPL")
                .bind(100.0 + i as f64)
                .bind(i)
                .execute(&recorder.db.pool)
                .await
                .unwrap();
        }

        let prediction = recorder.predict_price("AAPL", 120).await.unwrap();
        assert_eq!(prediction.trend, PredictedTrend::Up);
        assert!((prediction.confidence - 100.0).abs() < 1e-6);
        // slope 1/point, 2 steps ahead of the last point (119)
        assert!((prediction.predicted - 121.0).abs() < 1e-6);

        assert_eq!(
            recorder.predict_price("NOPE", 60).await.unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_trading_volume_buckets() {
        let recorder = recorder().await;
        let investor = Uuid::new_v4();

        recorder
            .record_trade(investor, "AAPL", Side::Buy, 10, 100.0, Some(1_000))
            .await
            .unwrap();
        recorder
            .record_trade(investor, "AAPL", Side::Buy, 30, 110.0, Some(1_500))
            .await
            .unwrap();
        recorder
            .record_trade(investor, "AAPL", Side::Buy, 5, 120.0, Some(9_000))
            .await
            .unwrap();

        let buckets = recorder
            .trading_volume("AAPL", Some(0), Some(10_000), 2_000)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].ts, 0);
        assert_eq!(buckets[0].volume, 40);
        assert_eq!(buckets[0].count, 2);
        // (10*100 + 30*110) / 40
        assert!((buckets[0].avg_price - 107.5).abs() < 1e-9);
        assert_eq!(buckets[1].ts, 8_000);
        assert_eq!(buckets[1].volume, 5);

        assert_eq!(
            recorder
                .trading_volume("AAPL", None, None, 0)
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
    }

    #[tokio::test]
    async fn test_most_volatile_ranking() {
        let recorder = recorder().await;
        let now = Utc::now().timestamp_millis();
        for (symbol, prices) in [
            ("FLAT", vec![100.0, 100.5, 100.2]),
            ("WILD", vec![100.0, 140.0, 80.0]),
        ] {
            for (i, price) in prices.iter().enumerate() {
                sqlx::query("INSERT INTO price_history (symbol, price, ts) VALUES (?, ?, ?)")
                    .bind(symbol)
                    .bind(price)
                    .bind(now - 1000 + i as i64)
                    .execute(&recorder.db.pool)
                    .await
                    .unwrap();
            }
        }

        let ranked = recorder.most_volatile(10, 60_000).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].symbol, "WILD");
        assert!(ranked[0].volatility_pct > ranked[1].volatility_pct);
    }
}
