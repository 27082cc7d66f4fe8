//! Shared Store
//!
//! Single SQLite file shared by every service. Each table has one owner;
//! cross-owner reads are fine, cross-owner writes are not. The schema and
//! the query-path indexes are created at connect time.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::{CoreError, CoreResult};

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub busy_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            // A single writer at a time keeps SQLite happy under load;
            // readers share the pool.
            max_connections: 8,
            acquire_timeout_secs: 5,
            busy_timeout_secs: 5,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Connect with default settings and initialize the schema
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        Self::connect_with_config(DatabaseConfig::new(path)).await
    }

    pub async fn connect_with_config(config: DatabaseConfig) -> anyhow::Result<Self> {
        tracing::info!(
            "Connecting to store at {} (max_connections={})",
            config.path,
            config.max_connections
        );

        // SQLite recognizes the ":memory:" filename itself
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true);

        // An in-memory database exists per connection; keep exactly one.
        let max_connections = if config.is_in_memory() {
            1
        } else {
            config.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;

        tracing::info!("Store ready");
        Ok(db)
    }

    /// Ephemeral store for tests
    pub async fn connect_ephemeral() -> anyhow::Result<Self> {
        Self::connect(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the store is reachable
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let statements = [
            // portfolio store
            "CREATE TABLE IF NOT EXISTS investors (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                balance TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS portfolio (
                investor TEXT NOT NULL,
                symbol TEXT NOT NULL,
                qty INTEGER NOT NULL,
                avg_price TEXT NOT NULL,
                PRIMARY KEY (investor, symbol)
            )",
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                investor TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty INTEGER NOT NULL,
                price TEXT NOT NULL,
                total TEXT NOT NULL,
                ts INTEGER NOT NULL
            )",
            // matching engine
            "CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                investor TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty INTEGER NOT NULL,
                limit_price TEXT NOT NULL,
                filled INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                buy_order_id TEXT NOT NULL,
                sell_order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                qty INTEGER NOT NULL,
                price TEXT NOT NULL,
                buyer TEXT NOT NULL,
                seller TEXT NOT NULL,
                ts INTEGER NOT NULL,
                settlement_status TEXT NOT NULL
            )",
            // price engine
            "CREATE TABLE IF NOT EXISTS stocks (
                symbol TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                current TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                volume INTEGER NOT NULL,
                last_updated INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS price_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                price REAL NOT NULL,
                ts INTEGER NOT NULL
            )",
            // analytics recorder
            "CREATE TABLE IF NOT EXISTS analytics_trades (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                investor TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty INTEGER NOT NULL,
                price REAL NOT NULL,
                ts INTEGER NOT NULL
            )",
            // webhook registry
            "CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                events TEXT NOT NULL,
                active INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            // query-path indexes
            "CREATE INDEX IF NOT EXISTS idx_price_history_symbol_ts
                ON price_history(symbol, ts)",
            "CREATE INDEX IF NOT EXISTS idx_portfolio_investor
                ON portfolio(investor)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_investor_ts
                ON transactions(investor, ts)",
            "CREATE INDEX IF NOT EXISTS idx_orders_investor_status
                ON orders(investor, status)",
            "CREATE INDEX IF NOT EXISTS idx_analytics_trades_symbol_ts
                ON analytics_trades(symbol, ts)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Parse a TEXT money column back into a `Decimal`.
/// SQLite has no decimal type; cash-bearing columns round-trip through the
/// canonical string form.
pub fn decimal_from_text(text: &str) -> CoreResult<Decimal> {
    text.parse::<Decimal>()
        .map_err(|e| CoreError::internal(format!("bad decimal in store: {} ({})", text, e)))
}
