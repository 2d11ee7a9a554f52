//! Repository for orders, open-order projections, trade logs and the dispatch outbox

use async_trait::async_trait;
use common::db::models::{DbOrder, DbPendingDispatch, DbTradeLog, DbUnfinishedOrder};
use common::db::{InMemoryTransactionManager, PgTransactionManager, SharedMemoryState};
use common::error::{Error, Result};
use common::model::order::{Order, PendingDispatch, UnfinishedOrder};
use common::model::trade::TradeLog;
use common::{DBTransaction, TransactionManager};
use chrono::Utc;
use sqlx::PgPool;
use tracing::debug;

/// Order repository trait
///
/// Methods taking a transaction read and write through it; the `find_*`
/// methods read committed state.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Get the transaction manager
    fn transaction_manager(&self) -> &dyn TransactionManager;

    /// Insert a new order
    async fn insert_order(&self, tx: &mut DBTransaction, order: &Order) -> Result<()>;

    /// Load an order for modification
    async fn get_order(&self, tx: &mut DBTransaction, order_id: &str) -> Result<Option<Order>>;

    /// Write back an order loaded with `get_order`
    async fn update_order(&self, tx: &mut DBTransaction, order: &Order) -> Result<()>;

    /// Get a committed order
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>>;

    /// Insert the open-order projection
    async fn insert_unfinished(&self, tx: &mut DBTransaction, unfinished: &UnfinishedOrder) -> Result<()>;

    /// Delete the open-order projection, if any
    async fn delete_unfinished(&self, tx: &mut DBTransaction, order_id: &str) -> Result<()>;

    /// Committed open orders of a symbol, oldest first
    async fn find_unfinished(&self, symbol: &str) -> Result<Vec<UnfinishedOrder>>;

    /// Append a trade log
    async fn insert_trade_log(&self, tx: &mut DBTransaction, log: &TradeLog) -> Result<()>;

    /// Whether a trade id was already settled
    async fn trade_log_exists(&self, tx: &mut DBTransaction, trade_id: &str) -> Result<bool>;

    /// Committed trade logs of a symbol, in trade time order
    async fn find_trade_logs(&self, symbol: &str) -> Result<Vec<TradeLog>>;

    /// Record an order descriptor that still has to reach the matching engine
    async fn insert_outbox(&self, tx: &mut DBTransaction, order_id: &str, symbol: &str, payload: &[u8]) -> Result<()>;

    /// Descriptors not confirmed as published, oldest first
    async fn pending_outbox(&self, limit: i64) -> Result<Vec<PendingDispatch>>;

    /// Forget a published descriptor
    async fn delete_outbox(&self, order_id: &str) -> Result<()>;

    /// Begin a database transaction
    async fn begin_transaction(&self) -> Result<DBTransaction> {
        self.transaction_manager().begin_transaction().await
    }
}

/// In-memory order repository
pub struct InMemoryOrderRepository {
    state: SharedMemoryState,
    transaction_manager: InMemoryTransactionManager,
}

impl InMemoryOrderRepository {
    /// Create a new in-memory repository over shared tables
    pub fn new(state: SharedMemoryState) -> Self {
        Self {
            transaction_manager: InMemoryTransactionManager::new(state.clone()),
            state,
        }
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    fn transaction_manager(&self) -> &dyn TransactionManager {
        &self.transaction_manager
    }

    async fn insert_order(&self, tx: &mut DBTransaction, order: &Order) -> Result<()> {
        let state = tx.in_memory()?;
        if state.orders.contains_key(&order.order_id) {
            return Err(Error::Internal(format!("Duplicate order id {}", order.order_id)));
        }
        state.orders.insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    async fn get_order(&self, tx: &mut DBTransaction, order_id: &str) -> Result<Option<Order>> {
        Ok(tx.in_memory()?.orders.get(order_id).cloned())
    }

    async fn update_order(&self, tx: &mut DBTransaction, order: &Order) -> Result<()> {
        let state = tx.in_memory()?;
        match state.orders.get_mut(&order.order_id) {
            Some(stored) => {
                *stored = order.clone();
                Ok(())
            }
            None => Err(Error::OrderNotFound(order.order_id.clone())),
        }
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(order_id).cloned())
    }

    async fn insert_unfinished(&self, tx: &mut DBTransaction, unfinished: &UnfinishedOrder) -> Result<()> {
        tx.in_memory()?
            .unfinished
            .insert(unfinished.order_id.clone(), unfinished.clone());
        Ok(())
    }

    async fn delete_unfinished(&self, tx: &mut DBTransaction, order_id: &str) -> Result<()> {
        tx.in_memory()?.unfinished.remove(order_id);
        Ok(())
    }

    async fn find_unfinished(&self, symbol: &str) -> Result<Vec<UnfinishedOrder>> {
        let state = self.state.lock().await;
        let mut open: Vec<UnfinishedOrder> = state
            .unfinished
            .values()
            .filter(|u| u.symbol == symbol)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn insert_trade_log(&self, tx: &mut DBTransaction, log: &TradeLog) -> Result<()> {
        let state = tx.in_memory()?;
        if state.trade_logs.contains_key(&log.trade_id) {
            return Err(Error::AlreadySettled(log.trade_id.clone()));
        }
        state.trade_logs.insert(log.trade_id.clone(), log.clone());
        Ok(())
    }

    async fn trade_log_exists(&self, tx: &mut DBTransaction, trade_id: &str) -> Result<bool> {
        Ok(tx.in_memory()?.trade_logs.contains_key(trade_id))
    }

    async fn find_trade_logs(&self, symbol: &str) -> Result<Vec<TradeLog>> {
        let state = self.state.lock().await;
        let mut logs: Vec<TradeLog> = state
            .trade_logs
            .values()
            .filter(|l| l.symbol == symbol)
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.trade_time.cmp(&b.trade_time).then(a.trade_id.cmp(&b.trade_id)));
        Ok(logs)
    }

    async fn insert_outbox(&self, tx: &mut DBTransaction, order_id: &str, symbol: &str, payload: &[u8]) -> Result<()> {
        let state = tx.in_memory()?;
        state.next_outbox_id += 1;
        let id = state.next_outbox_id;
        state.outbox.insert(
            id,
            PendingDispatch {
                id,
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
                payload: payload.to_vec(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn pending_outbox(&self, limit: i64) -> Result<Vec<PendingDispatch>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn delete_outbox(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.outbox.retain(|_, pending| pending.order_id != order_id);
        Ok(())
    }
}

/// PostgreSQL order repository
pub struct PostgresOrderRepository {
    /// Database connection pool
    pool: PgPool,
    /// Transaction manager
    transaction_manager: PgTransactionManager,
}

impl PostgresOrderRepository {
    /// Create a new PostgreSQL repository
    pub fn new(pool: PgPool) -> Self {
        Self {
            transaction_manager: PgTransactionManager::new(pool.clone()),
            pool,
        }
    }
}

const ORDER_COLUMNS: &str = "order_id, symbol, side, order_type, user_id, price, quantity, amount, \
     avg_price, finished_qty, finished_amount, fee_rate, fee, freeze_qty, freeze_amount, status, \
     created_at, updated_at";

const TRADE_LOG_COLUMNS: &str = "trade_id, symbol, ask_order_id, bid_order_id, ask_user_id, bid_user_id, \
     price, quantity, amount, ask_fee, bid_fee, taker, trade_time, created_at";

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    fn transaction_manager(&self) -> &dyn TransactionManager {
        &self.transaction_manager
    }

    async fn insert_order(&self, tx: &mut DBTransaction, order: &Order) -> Result<()> {
        debug!("Inserting order {} into database", order.order_id);

        sqlx::query(&format!(
            "INSERT INTO orders ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            ORDER_COLUMNS
        ))
        .bind(&order.order_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(&order.user_id)
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.amount)
        .bind(order.avg_price)
        .bind(order.finished_qty)
        .bind(order.finished_amount)
        .bind(order.fee_rate)
        .bind(order.fee)
        .bind(order.freeze_qty)
        .bind(order.freeze_amount)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(tx.postgres()?)
        .await?;
        Ok(())
    }

    async fn get_order(&self, tx: &mut DBTransaction, order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, DbOrder>(&format!(
            "SELECT {} FROM orders WHERE order_id = $1 FOR UPDATE",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(tx.postgres()?)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn update_order(&self, tx: &mut DBTransaction, order: &Order) -> Result<()> {
        let result = sqlx::query(
            "UPDATE orders
             SET avg_price = $2, finished_qty = $3, finished_amount = $4, fee = $5,
                 freeze_qty = $6, freeze_amount = $7, status = $8, updated_at = $9
             WHERE order_id = $1",
        )
        .bind(&order.order_id)
        .bind(order.avg_price)
        .bind(order.finished_qty)
        .bind(order.finished_amount)
        .bind(order.fee)
        .bind(order.freeze_qty)
        .bind(order.freeze_amount)
        .bind(order.status.as_str())
        .bind(order.updated_at)
        .execute(tx.postgres()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::OrderNotFound(order.order_id.clone()));
        }
        Ok(())
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, DbOrder>(&format!(
            "SELECT {} FROM orders WHERE order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn insert_unfinished(&self, tx: &mut DBTransaction, unfinished: &UnfinishedOrder) -> Result<()> {
        sqlx::query(
            "INSERT INTO unfinished_orders
                (order_id, symbol, side, order_type, user_id, price, quantity, amount, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&unfinished.order_id)
        .bind(&unfinished.symbol)
        .bind(unfinished.side.as_str())
        .bind(unfinished.order_type.as_str())
        .bind(&unfinished.user_id)
        .bind(unfinished.price)
        .bind(unfinished.quantity)
        .bind(unfinished.amount)
        .bind(unfinished.created_at)
        .execute(tx.postgres()?)
        .await?;
        Ok(())
    }

    async fn delete_unfinished(&self, tx: &mut DBTransaction, order_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM unfinished_orders WHERE order_id = $1")
            .bind(order_id)
            .execute(tx.postgres()?)
            .await?;
        Ok(())
    }

    async fn find_unfinished(&self, symbol: &str) -> Result<Vec<UnfinishedOrder>> {
        let rows = sqlx::query_as::<_, DbUnfinishedOrder>(
            "SELECT order_id, symbol, side, order_type, user_id, price, quantity, amount, created_at
             FROM unfinished_orders
             WHERE symbol = $1
             ORDER BY created_at",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UnfinishedOrder::try_from).collect()
    }

    async fn insert_trade_log(&self, tx: &mut DBTransaction, log: &TradeLog) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO trade_logs ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (trade_id) DO NOTHING",
            TRADE_LOG_COLUMNS
        ))
        .bind(&log.trade_id)
        .bind(&log.symbol)
        .bind(&log.ask_order_id)
        .bind(&log.bid_order_id)
        .bind(&log.ask_user_id)
        .bind(&log.bid_user_id)
        .bind(log.price)
        .bind(log.quantity)
        .bind(log.amount)
        .bind(log.ask_fee)
        .bind(log.bid_fee)
        .bind(log.taker.as_str())
        .bind(log.trade_time)
        .bind(log.created_at)
        .execute(tx.postgres()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::AlreadySettled(log.trade_id.clone()));
        }
        Ok(())
    }

    async fn trade_log_exists(&self, tx: &mut DBTransaction, trade_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM trade_logs WHERE trade_id = $1)")
            .bind(trade_id)
            .fetch_one(tx.postgres()?)
            .await?;
        Ok(exists)
    }

    async fn find_trade_logs(&self, symbol: &str) -> Result<Vec<TradeLog>> {
        let rows = sqlx::query_as::<_, DbTradeLog>(&format!(
            "SELECT {} FROM trade_logs WHERE symbol = $1 ORDER BY trade_time, trade_id",
            TRADE_LOG_COLUMNS
        ))
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TradeLog::try_from).collect()
    }

    async fn insert_outbox(&self, tx: &mut DBTransaction, order_id: &str, symbol: &str, payload: &[u8]) -> Result<()> {
        sqlx::query("INSERT INTO order_outbox (order_id, symbol, payload) VALUES ($1, $2, $3)")
            .bind(order_id)
            .bind(symbol)
            .bind(payload)
            .execute(tx.postgres()?)
            .await?;
        Ok(())
    }

    async fn pending_outbox(&self, limit: i64) -> Result<Vec<PendingDispatch>> {
        let rows = sqlx::query_as::<_, DbPendingDispatch>(
            "SELECT id, order_id, symbol, payload, created_at
             FROM order_outbox
             ORDER BY id
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PendingDispatch::from).collect())
    }

    async fn delete_outbox(&self, order_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM order_outbox WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
