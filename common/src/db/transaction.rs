//! Transaction handling for database operations
//!
//! This module provides a standardized approach to database transactions
//! across all services. Ledger and order repositories take a
//! `&mut DBTransaction` so that a freeze and the order it belongs to, or the
//! balance movements and order updates of a trade leg, commit or roll back
//! together.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction as SqlxTransaction};
use tokio::sync::OwnedMutexGuard;

use crate::db::memory::{MemoryState, SharedMemoryState};
use crate::error::{Error, Result};

/// Transaction enum that can be either PostgreSQL or in-memory
pub enum DBTransaction {
    /// PostgreSQL transaction
    Postgres(PgTransaction),
    /// In-memory transaction
    InMemory(InMemoryTransaction),
}

/// Transaction interface methods
impl DBTransaction {
    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        match self {
            DBTransaction::Postgres(tx) => tx.commit().await,
            DBTransaction::InMemory(tx) => tx.commit().await,
        }
    }

    /// Rollback the transaction
    pub async fn rollback(self) -> Result<()> {
        match self {
            DBTransaction::Postgres(tx) => tx.rollback().await,
            DBTransaction::InMemory(tx) => tx.rollback().await,
        }
    }

    /// Connection of a PostgreSQL transaction
    pub fn postgres(&mut self) -> Result<&mut PgConnection> {
        match self {
            DBTransaction::Postgres(tx) => Ok(tx.conn()),
            DBTransaction::InMemory(_) => Err(Error::Internal(
                "PostgreSQL repository used with an in-memory transaction".to_string(),
            )),
        }
    }

    /// Working state of an in-memory transaction
    pub fn in_memory(&mut self) -> Result<&mut MemoryState> {
        match self {
            DBTransaction::InMemory(tx) => Ok(tx.state_mut()),
            DBTransaction::Postgres(_) => Err(Error::Internal(
                "in-memory repository used with a PostgreSQL transaction".to_string(),
            )),
        }
    }
}

/// A PostgreSQL transaction implementation
pub struct PgTransaction {
    tx: SqlxTransaction<'static, Postgres>,
}

impl PgTransaction {
    /// Create a new PgTransaction
    pub fn new(tx: SqlxTransaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    /// Connection to run queries on inside this transaction
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(Error::Persistence)
    }

    /// Rollback the transaction
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(Error::Persistence)
    }
}

/// Transaction manager trait for creating and managing transactions
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Begin a new transaction
    async fn begin_transaction(&self) -> Result<DBTransaction>;
}

/// A PostgreSQL transaction manager implementation
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    /// Create a new PgTransactionManager
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    async fn begin_transaction(&self) -> Result<DBTransaction> {
        let tx = self.pool.begin().await.map_err(Error::Persistence)?;
        Ok(DBTransaction::Postgres(PgTransaction::new(tx)))
    }
}

/// In-memory transaction
///
/// Holds the shared state's lock until it ends and mutates a private copy
/// that only replaces the shared state on commit. The append-only asset log
/// is not copied: the working state starts with an empty log and its entries
/// are appended to the shared log on commit.
///
/// Every transaction still copies the remaining tables, so this backend is
/// meant for tests and demos, not for long-running processes.
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl InMemoryTransaction {
    /// Start a transaction over `state`, waiting for any transaction in flight
    pub async fn begin(state: SharedMemoryState) -> Self {
        let mut guard = state.lock_owned().await;
        let logs = std::mem::take(&mut guard.asset_logs);
        let working = guard.clone();
        guard.asset_logs = logs;
        Self { guard, working }
    }

    pub fn state_mut(&mut self) -> &mut MemoryState {
        &mut self.working
    }

    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        let Self { mut guard, mut working } = self;
        let appended = std::mem::take(&mut working.asset_logs);
        let mut logs = std::mem::take(&mut guard.asset_logs);
        logs.extend(appended);
        working.asset_logs = logs;
        *guard = working;
        Ok(())
    }

    /// Rollback the transaction
    pub async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

/// In-memory transaction manager
pub struct InMemoryTransactionManager {
    state: SharedMemoryState,
}

impl InMemoryTransactionManager {
    /// Create a new in-memory transaction manager over shared tables
    pub fn new(state: SharedMemoryState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl TransactionManager for InMemoryTransactionManager {
    async fn begin_transaction(&self) -> Result<DBTransaction> {
        Ok(DBTransaction::InMemory(
            InMemoryTransaction::begin(self.state.clone()).await,
        ))
    }
}
