//! Trade Store (C2): the durable record of every intent, order, fill,
//! and resolution, and the principal ledger derived from it.
//!
//! Schema mirrors `original_source/agents/trading/trade_db.py`'s
//! `RealTradeThreshold` model (column names and semantics), persisted via
//! dynamic `sqlx` queries rather than the compile-time-checked macros
//! `common::db` could otherwise use — see DESIGN.md for why.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum OrderSide {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

/// The central trade record. See spec §3 for the field groupings and
/// invariants this struct must uphold.
#[derive(Debug, Clone, FromRow)]
pub struct Trade {
    pub trade_id: Uuid,
    pub deployment_id: String,
    pub market_id: String,
    pub slug: String,
    pub token_id: String,
    pub order_side: OrderSide,

    pub buy_order_id: Option<String>,
    pub buy_price: Decimal,
    pub buy_size_ordered: Decimal,
    pub buy_status: OrderStatus,
    pub buy_filled_shares: Option<Decimal>,
    pub buy_fill_price: Option<Decimal>,
    pub buy_dollars_spent: Option<Decimal>,
    pub buy_fee: Option<Decimal>,
    pub order_placed_at: DateTime<Utc>,
    pub order_filled_at: Option<DateTime<Utc>>,

    pub sell_order_id: Option<String>,
    pub sell_price: Option<Decimal>,
    pub sell_size: Option<Decimal>,
    pub sell_status: Option<OrderStatus>,
    pub sell_shares_filled: Option<Decimal>,
    pub sell_dollars_received: Option<Decimal>,
    pub sell_fee: Option<Decimal>,
    pub sell_order_placed_at: Option<DateTime<Utc>>,
    pub sell_order_filled_at: Option<DateTime<Utc>>,

    pub outcome_price: Option<Decimal>,
    pub winning_side: Option<OrderSide>,
    pub payout: Option<Decimal>,
    pub net_payout: Option<Decimal>,
    pub roi: Option<Decimal>,
    pub is_win: Option<bool>,
    pub principal_before: Decimal,
    pub principal_after: Option<Decimal>,
    pub market_resolved_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Parameters for creating a new trade row (buy side).
pub struct NewTrade {
    pub deployment_id: String,
    pub market_id: String,
    pub slug: String,
    pub token_id: String,
    pub order_side: OrderSide,
    pub buy_price: Decimal,
    pub buy_size_ordered: Decimal,
    pub principal_before: Decimal,
}

pub struct TradeStore {
    pool: PgPool,
}

impl TradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `trades` table and any missing columns. Swallows
    /// "already exists" errors from concurrent startups; any other
    /// failure is fatal per spec §4.1.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let statement = r#"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id UUID PRIMARY KEY,
                deployment_id VARCHAR NOT NULL,
                market_id VARCHAR NOT NULL,
                slug VARCHAR NOT NULL,
                token_id VARCHAR NOT NULL,
                order_side VARCHAR NOT NULL,

                buy_order_id VARCHAR,
                buy_price NUMERIC NOT NULL,
                buy_size_ordered NUMERIC NOT NULL,
                buy_status VARCHAR NOT NULL DEFAULT 'open',
                buy_filled_shares NUMERIC,
                buy_fill_price NUMERIC,
                buy_dollars_spent NUMERIC,
                buy_fee NUMERIC,
                order_placed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                order_filled_at TIMESTAMPTZ,

                sell_order_id VARCHAR,
                sell_price NUMERIC,
                sell_size NUMERIC,
                sell_status VARCHAR,
                sell_shares_filled NUMERIC,
                sell_dollars_received NUMERIC,
                sell_fee NUMERIC,
                sell_order_placed_at TIMESTAMPTZ,
                sell_order_filled_at TIMESTAMPTZ,

                outcome_price NUMERIC,
                winning_side VARCHAR,
                payout NUMERIC,
                net_payout NUMERIC,
                roi NUMERIC,
                is_win BOOLEAN,
                principal_before NUMERIC NOT NULL,
                principal_after NUMERIC,
                market_resolved_at TIMESTAMPTZ,
                error_message TEXT
            )
        "#;
        match sqlx::query(statement).execute(&self.pool).await {
            Ok(_) => {}
            Err(e) if e.to_string().contains("already exists") => {}
            Err(e) => return Err(e.into()),
        }

        // Existing deployments may be running against a table created by an
        // older version of this schema; add any columns it's missing rather
        // than assuming `CREATE TABLE IF NOT EXISTS` already covers them.
        let columns = [
            ("buy_order_id", "VARCHAR"),
            ("buy_filled_shares", "NUMERIC"),
            ("buy_fill_price", "NUMERIC"),
            ("buy_dollars_spent", "NUMERIC"),
            ("buy_fee", "NUMERIC"),
            ("order_filled_at", "TIMESTAMPTZ"),
            ("sell_order_id", "VARCHAR"),
            ("sell_price", "NUMERIC"),
            ("sell_size", "NUMERIC"),
            ("sell_status", "VARCHAR"),
            ("sell_shares_filled", "NUMERIC"),
            ("sell_dollars_received", "NUMERIC"),
            ("sell_fee", "NUMERIC"),
            ("sell_order_placed_at", "TIMESTAMPTZ"),
            ("sell_order_filled_at", "TIMESTAMPTZ"),
            ("outcome_price", "NUMERIC"),
            ("winning_side", "VARCHAR"),
            ("payout", "NUMERIC"),
            ("net_payout", "NUMERIC"),
            ("roi", "NUMERIC"),
            ("is_win", "BOOLEAN"),
            ("principal_after", "NUMERIC"),
            ("market_resolved_at", "TIMESTAMPTZ"),
            ("error_message", "TEXT"),
        ];
        for (column, sql_type) in columns {
            let stmt = format!("ALTER TABLE trades ADD COLUMN {column} {sql_type}");
            if let Err(e) = sqlx::query(&stmt).execute(&self.pool).await {
                if !e.to_string().contains("already exists") {
                    return Err(e.into());
                }
            }
        }

        let indexes = [
            "CREATE INDEX IF NOT EXISTS trades_slug_idx ON trades (slug)",
            "CREATE INDEX IF NOT EXISTS trades_deployment_idx ON trades (deployment_id)",
            "CREATE INDEX IF NOT EXISTS trades_buy_order_id_idx ON trades (buy_order_id)",
            "CREATE INDEX IF NOT EXISTS trades_sell_order_id_idx ON trades (sell_order_id)",
        ];
        for stmt in indexes {
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                if !e.to_string().contains("already exists") {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    pub async fn create_trade(&self, new: NewTrade) -> Result<Uuid, StoreError> {
        let trade_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, deployment_id, market_id, slug, token_id, order_side,
                buy_price, buy_size_ordered, buy_status, principal_before
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'open', $9)
            "#,
        )
        .bind(trade_id)
        .bind(&new.deployment_id)
        .bind(&new.market_id)
        .bind(&new.slug)
        .bind(&new.token_id)
        .bind(order_side_str(new.order_side))
        .bind(new.buy_price)
        .bind(new.buy_size_ordered)
        .bind(new.principal_before)
        .execute(&self.pool)
        .await?;
        Ok(trade_id)
    }

    /// Idempotent on (trade_id, status): a second call with the same
    /// terminal status is a no-op write that produces the same row.
    pub async fn update_buy_fill(
        &self,
        trade_id: Uuid,
        filled_shares: Decimal,
        fill_price: Decimal,
        dollars_spent: Decimal,
        fee: Decimal,
        status: OrderStatus,
        buy_order_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE trades SET
                buy_order_id = $2,
                buy_filled_shares = $3,
                buy_fill_price = $4,
                buy_dollars_spent = $5,
                buy_fee = $6,
                buy_status = $7,
                order_filled_at = now()
            WHERE trade_id = $1
            "#,
        )
        .bind(trade_id)
        .bind(buy_order_id)
        .bind(filled_shares)
        .bind(fill_price)
        .bind(dollars_spent)
        .bind(fee)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records the exchange order id once placement succeeds, before any
    /// fill evidence exists. Separate from `update_buy_fill` because the
    /// id is known well before the fill is.
    pub async fn record_buy_placement(
        &self,
        trade_id: Uuid,
        buy_order_id: &str,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE trades SET buy_order_id = $2, buy_status = $3 WHERE trade_id = $1")
            .bind(trade_id)
            .bind(buy_order_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_sell_status(&self, trade_id: Uuid, status: OrderStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE trades SET sell_status = $2 WHERE trade_id = $1")
            .bind(trade_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_buy_status(
        &self,
        trade_id: Uuid,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE trades SET buy_status = $2, error_message = COALESCE($3, error_message) WHERE trade_id = $1",
        )
        .bind(trade_id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets sell fields. Only called once the sell order id has been
    /// verified via `get_order` (spec §4.4 placement-verification).
    pub async fn update_sell_order(
        &self,
        trade_id: Uuid,
        sell_order_id: &str,
        price: Decimal,
        size: Decimal,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE trades SET
                sell_order_id = $2,
                sell_price = $3,
                sell_size = $4,
                sell_status = $5,
                sell_order_placed_at = now()
            WHERE trade_id = $1
            "#,
        )
        .bind(trade_id)
        .bind(sell_order_id)
        .bind(price)
        .bind(size)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_sell_fill(
        &self,
        trade_id: Uuid,
        status: OrderStatus,
        shares_filled: Decimal,
        dollars_received: Decimal,
        fee: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE trades SET
                sell_status = $2,
                sell_shares_filled = $3,
                sell_dollars_received = $4,
                sell_fee = $5,
                sell_order_filled_at = now()
            WHERE trade_id = $1
            "#,
        )
        .bind(trade_id)
        .bind(status.as_str())
        .bind(shares_filled)
        .bind(dollars_received)
        .bind(fee)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_resolution(
        &self,
        trade_id: Uuid,
        outcome_price: Decimal,
        payout: Decimal,
        net_payout: Decimal,
        roi: Decimal,
        is_win: bool,
        principal_after: Decimal,
        winning_side: OrderSide,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE trades SET
                outcome_price = $2,
                payout = $3,
                net_payout = $4,
                roi = $5,
                is_win = $6,
                principal_after = $7,
                winning_side = $8,
                market_resolved_at = now()
            WHERE trade_id = $1
            "#,
        )
        .bind(trade_id)
        .bind(outcome_price)
        .bind(payout)
        .bind(net_payout)
        .bind(roi)
        .bind(is_win)
        .bind(principal_after)
        .bind(order_side_str(winning_side))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Used twice before any buy (spec §4.5.1 gate 4 and again just
    /// before placement) to close the race window between check and act.
    pub async fn has_bet_on_market(&self, slug: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM trades WHERE slug = $1")
            .bind(slug)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Latest `principal_after` of this deployment's most recent resolved
    /// trade meeting the recovery-eligibility filters in spec §3.
    pub async fn latest_principal(&self, deployment_id: &str) -> Result<Option<Decimal>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT principal_after FROM trades
            WHERE deployment_id = $1
              AND buy_order_id IS NOT NULL
              AND market_resolved_at IS NOT NULL
              AND buy_status != 'failed'
              AND principal_after IS NOT NULL
              AND principal_after > 0
            ORDER BY market_resolved_at DESC
            LIMIT 1
            "#,
        )
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| r.try_get::<Decimal, _>("principal_after").ok()))
    }

    pub async fn open_buys(&self, deployment_id: &str) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE deployment_id = $1 AND buy_status IN ('open', 'partial')",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    pub async fn open_sells(&self, deployment_id: &str) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE deployment_id = $1 AND sell_status IN ('open', 'partial')",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    /// `sell_status = filled`, market still unresolved — candidates for the
    /// recently-filled revalidation gate (a sell flagged filled less than
    /// two minutes ago may still be live on the exchange).
    pub async fn recently_filled_sells(&self, deployment_id: &str) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE deployment_id = $1 AND sell_status = 'filled' AND market_resolved_at IS NULL",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    pub async fn unresolved(&self, deployment_id: &str) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE deployment_id = $1 AND market_resolved_at IS NULL",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    /// `buy_status = filled`, no `sell_order_id`, unresolved, filled >= 30s
    /// ago. The reconciler re-invokes SELL placement for these (spec §4.4
    /// step 5).
    pub async fn filled_without_sell(&self, deployment_id: &str) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            r#"
            SELECT * FROM trades
            WHERE deployment_id = $1
              AND buy_status = 'filled'
              AND sell_order_id IS NULL
              AND market_resolved_at IS NULL
              AND order_filled_at IS NOT NULL
              AND order_filled_at <= now() - interval '30 seconds'
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    pub async fn trades_by_deployment_and_market(
        &self,
        deployment_id: &str,
        slug: &str,
    ) -> Result<Vec<Trade>, StoreError> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE deployment_id = $1 AND slug = $2",
        )
        .bind(deployment_id)
        .bind(slug)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }
}

fn order_side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Yes => "yes",
        OrderSide::No => "no",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_as_str() {
        assert_eq!(OrderStatus::Open.as_str(), "open");
        assert_eq!(OrderStatus::Filled.as_str(), "filled");
        assert_eq!(OrderStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn order_side_str_matches_lowercase() {
        assert_eq!(order_side_str(OrderSide::Yes), "yes");
        assert_eq!(order_side_str(OrderSide::No), "no");
    }

    async fn test_store() -> TradeStore {
        dotenvy::dotenv().ok();
        let config = common::Config::from_env().expect("DATABASE_URL must be set for this test");
        let db = common::Database::connect(&config)
            .await
            .expect("test database should be reachable");
        let store = TradeStore::new(db.pool().clone());
        store.migrate().await.expect("migration should succeed");
        store
    }

    #[tokio::test]
    async fn create_and_read_back_a_trade() {
        let store = test_store().await;
        let deployment_id = format!("test-{}", Uuid::new_v4());
        let slug = format!("slug-{}", Uuid::new_v4());

        let trade_id = store
            .create_trade(NewTrade {
                deployment_id: deployment_id.clone(),
                market_id: "cond-1".into(),
                slug: slug.clone(),
                token_id: "token-1".into(),
                order_side: OrderSide::Yes,
                buy_price: Decimal::new(52, 2),
                buy_size_ordered: Decimal::new(10, 0),
                principal_before: Decimal::new(100, 0),
            })
            .await
            .expect("insert should succeed");

        assert!(store.has_bet_on_market(&slug).await.unwrap());

        let open = store.open_buys(&deployment_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, trade_id);
    }

    #[tokio::test]
    async fn latest_principal_ignores_unresolved_trades() {
        let store = test_store().await;
        let deployment_id = format!("test-{}", Uuid::new_v4());
        let slug = format!("slug-{}", Uuid::new_v4());

        store
            .create_trade(NewTrade {
                deployment_id: deployment_id.clone(),
                market_id: "cond-2".into(),
                slug,
                token_id: "token-2".into(),
                order_side: OrderSide::No,
                buy_price: Decimal::new(40, 2),
                buy_size_ordered: Decimal::new(5, 0),
                principal_before: Decimal::new(100, 0),
            })
            .await
            .unwrap();

        assert_eq!(store.latest_principal(&deployment_id).await.unwrap(), None);
    }
}
