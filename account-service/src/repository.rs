//! Repository for ledger data

use async_trait::async_trait;
use chrono::Utc;
use common::db::models::{DbBalance, DbFreeze};
use common::db::{InMemoryTransactionManager, PgTransactionManager, SharedMemoryState};
use common::error::{Error, Result};
use common::model::account::{AssetLog, Balance, FreezeRecord};
use common::{DBTransaction, TransactionManager};
use sqlx::PgPool;
use tracing::debug;

/// Ledger repository trait defining the interface for balance storage
///
/// Methods taking a transaction read and write through it; the others read
/// committed state.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Get the transaction manager
    fn transaction_manager(&self) -> &dyn TransactionManager;

    /// Get a committed balance
    async fn get_balance(&self, user_id: &str, asset: &str) -> Result<Option<Balance>>;

    /// Get all committed balances of a user
    async fn get_balances(&self, user_id: &str) -> Result<Vec<Balance>>;

    /// Load a balance for modification, creating an empty one if needed
    async fn balance_for_update(&self, tx: &mut DBTransaction, user_id: &str, asset: &str) -> Result<Balance>;

    /// Write a balance loaded with `balance_for_update`
    async fn save_balance(&self, tx: &mut DBTransaction, balance: &Balance) -> Result<()>;

    /// Load a freeze record for modification
    async fn get_freeze(&self, tx: &mut DBTransaction, asset: &str, ref_id: &str) -> Result<Option<FreezeRecord>>;

    /// Insert or update a freeze record
    async fn save_freeze(&self, tx: &mut DBTransaction, record: &FreezeRecord) -> Result<()>;

    /// Append a movement to the asset log
    async fn append_log(&self, tx: &mut DBTransaction, log: &AssetLog) -> Result<()>;

    /// Begin a database transaction
    async fn begin_transaction(&self) -> Result<DBTransaction> {
        self.transaction_manager().begin_transaction().await
    }
}

/// In-memory repository for ledger data
pub struct InMemoryAccountRepository {
    state: SharedMemoryState,
    /// Transaction manager
    transaction_manager: InMemoryTransactionManager,
}

impl InMemoryAccountRepository {
    /// Create a new in-memory repository over shared tables
    pub fn new(state: SharedMemoryState) -> Self {
        Self {
            transaction_manager: InMemoryTransactionManager::new(state.clone()),
            state,
        }
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    fn transaction_manager(&self) -> &dyn TransactionManager {
        &self.transaction_manager
    }

    async fn get_balance(&self, user_id: &str, asset: &str) -> Result<Option<Balance>> {
        let state = self.state.lock().await;
        Ok(state.balances.get(&(user_id.to_string(), asset.to_string())).cloned())
    }

    async fn get_balances(&self, user_id: &str) -> Result<Vec<Balance>> {
        let state = self.state.lock().await;
        let mut balances: Vec<Balance> = state
            .balances
            .iter()
            .filter(|((uid, _), _)| uid == user_id)
            .map(|(_, balance)| balance.clone())
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    async fn balance_for_update(&self, tx: &mut DBTransaction, user_id: &str, asset: &str) -> Result<Balance> {
        let state = tx.in_memory()?;
        let balance = state
            .balances
            .entry((user_id.to_string(), asset.to_string()))
            .or_insert_with(|| Balance::new(user_id.to_string(), asset.to_string()));
        Ok(balance.clone())
    }

    async fn save_balance(&self, tx: &mut DBTransaction, balance: &Balance) -> Result<()> {
        let state = tx.in_memory()?;
        state
            .balances
            .insert((balance.user_id.clone(), balance.asset.clone()), balance.clone());
        Ok(())
    }

    async fn get_freeze(&self, tx: &mut DBTransaction, asset: &str, ref_id: &str) -> Result<Option<FreezeRecord>> {
        let state = tx.in_memory()?;
        Ok(state.freezes.get(&(asset.to_string(), ref_id.to_string())).cloned())
    }

    async fn save_freeze(&self, tx: &mut DBTransaction, record: &FreezeRecord) -> Result<()> {
        let state = tx.in_memory()?;
        state
            .freezes
            .insert((record.asset.clone(), record.ref_id.clone()), record.clone());
        Ok(())
    }

    async fn append_log(&self, tx: &mut DBTransaction, log: &AssetLog) -> Result<()> {
        tx.in_memory()?.asset_logs.push(log.clone());
        Ok(())
    }
}

/// PostgreSQL repository for ledger data
pub struct PostgresAccountRepository {
    /// Database connection pool
    pool: PgPool,
    /// Transaction manager
    transaction_manager: PgTransactionManager,
}

impl PostgresAccountRepository {
    /// Create a new PostgreSQL repository
    pub fn new(pool: PgPool) -> Self {
        Self {
            transaction_manager: PgTransactionManager::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    fn transaction_manager(&self) -> &dyn TransactionManager {
        &self.transaction_manager
    }

    async fn get_balance(&self, user_id: &str, asset: &str) -> Result<Option<Balance>> {
        debug!("Getting balance from database: {} for {}", asset, user_id);

        let row = sqlx::query_as::<_, DbBalance>(
            "SELECT user_id, asset, total, available, frozen, updated_at
             FROM assets
             WHERE user_id = $1 AND asset = $2",
        )
        .bind(user_id)
        .bind(asset)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Balance::from))
    }

    async fn get_balances(&self, user_id: &str) -> Result<Vec<Balance>> {
        debug!("Getting all balances for user: {}", user_id);

        let rows = sqlx::query_as::<_, DbBalance>(
            "SELECT user_id, asset, total, available, frozen, updated_at
             FROM assets
             WHERE user_id = $1
             ORDER BY asset",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Balance::from).collect())
    }

    async fn balance_for_update(&self, tx: &mut DBTransaction, user_id: &str, asset: &str) -> Result<Balance> {
        let conn = tx.postgres()?;

        sqlx::query("INSERT INTO assets (user_id, asset) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .bind(asset)
            .execute(&mut *conn)
            .await?;

        let row = sqlx::query_as::<_, DbBalance>(
            "SELECT user_id, asset, total, available, frozen, updated_at
             FROM assets
             WHERE user_id = $1 AND asset = $2
             FOR UPDATE",
        )
        .bind(user_id)
        .bind(asset)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.into())
    }

    async fn save_balance(&self, tx: &mut DBTransaction, balance: &Balance) -> Result<()> {
        let result = sqlx::query(
            "UPDATE assets
             SET total = $3, available = $4, frozen = $5, updated_at = NOW()
             WHERE user_id = $1 AND asset = $2",
        )
        .bind(&balance.user_id)
        .bind(&balance.asset)
        .bind(balance.total)
        .bind(balance.available)
        .bind(balance.freeze)
        .execute(tx.postgres()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Internal(format!(
                "Failed to update balance for user: {}, asset: {}",
                balance.user_id, balance.asset
            )));
        }
        Ok(())
    }

    async fn get_freeze(&self, tx: &mut DBTransaction, asset: &str, ref_id: &str) -> Result<Option<FreezeRecord>> {
        let row = sqlx::query_as::<_, DbFreeze>(
            "SELECT user_id, asset, ref_id, original, amount, behavior, context, created_at, updated_at
             FROM assets_freeze
             WHERE asset = $1 AND ref_id = $2
             FOR UPDATE",
        )
        .bind(asset)
        .bind(ref_id)
        .fetch_optional(tx.postgres()?)
        .await?;

        row.map(FreezeRecord::try_from).transpose()
    }

    async fn save_freeze(&self, tx: &mut DBTransaction, record: &FreezeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO assets_freeze
                (asset, ref_id, user_id, original, amount, behavior, context, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (asset, ref_id)
             DO UPDATE SET amount = EXCLUDED.amount, updated_at = EXCLUDED.updated_at",
        )
        .bind(&record.asset)
        .bind(&record.ref_id)
        .bind(&record.user_id)
        .bind(record.original)
        .bind(record.amount)
        .bind(record.behavior.as_str())
        .bind(&record.context)
        .bind(record.created_at)
        .bind(Utc::now())
        .execute(tx.postgres()?)
        .await?;
        Ok(())
    }

    async fn append_log(&self, tx: &mut DBTransaction, log: &AssetLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO assets_log
                (user_id, asset, change_available, change_freeze, ref_id, behavior, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&log.user_id)
        .bind(&log.asset)
        .bind(log.change_available)
        .bind(log.change_freeze)
        .bind(&log.ref_id)
        .bind(log.behavior.as_str())
        .bind(log.created_at)
        .execute(tx.postgres()?)
        .await?;
        Ok(())
    }
}
