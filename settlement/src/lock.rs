//! Distributed per-order lock
//!
//! Two pieces of state live per order id:
//!
//! * a reference count of registered legs, incremented when a trade result
//!   is accepted from the queue and decremented when its settlement task
//!   ends, whatever the outcome. A leg flagged `last` for an order waits
//!   until that order's count has dropped to its own registration.
//! * an exclusive hold, taken for every id of a leg at once while the leg's
//!   transaction runs, so two legs sharing an order never interleave.

use std::collections::HashMap;

use async_trait::async_trait;
use common::error::{Error, Result};
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::Mutex;

/// Whether any leg still references an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held,
}

#[async_trait]
pub trait OrderLock: Send + Sync {
    /// Register one pending leg on each id
    async fn lock(&self, ids: &[&str]) -> Result<()>;

    /// Drop one registration from each id
    async fn unlock(&self, ids: &[&str]) -> Result<()>;

    /// Number of pending legs registered on `id`
    async fn get_lock(&self, id: &str) -> Result<u64>;

    /// Hold every id for `owner`, or none of them
    async fn try_acquire(&self, ids: &[&str], owner: &str) -> Result<bool>;

    /// Give up the holds `owner` has on `ids`
    async fn release(&self, ids: &[&str], owner: &str) -> Result<()>;

    async fn state(&self, id: &str) -> Result<LockState> {
        Ok(if self.get_lock(id).await? > 0 {
            LockState::Held
        } else {
            LockState::Free
        })
    }
}

/// Lock store for a single process
#[derive(Default)]
pub struct InMemoryOrderLock {
    refs: DashMap<String, u64>,
    holds: Mutex<HashMap<String, String>>,
}

impl InMemoryOrderLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `id`, if any
    pub async fn holder(&self, id: &str) -> Option<String> {
        self.holds.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl OrderLock for InMemoryOrderLock {
    async fn lock(&self, ids: &[&str]) -> Result<()> {
        for id in ids {
            *self.refs.entry(id.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn unlock(&self, ids: &[&str]) -> Result<()> {
        for id in ids {
            let drained = match self.refs.get_mut(*id) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if drained {
                self.refs.remove_if(*id, |_, count| *count == 0);
            }
        }
        Ok(())
    }

    async fn get_lock(&self, id: &str) -> Result<u64> {
        Ok(self.refs.get(id).map_or(0, |count| *count))
    }

    async fn try_acquire(&self, ids: &[&str], owner: &str) -> Result<bool> {
        let mut holds = self.holds.lock().await;
        if ids.iter().any(|id| holds.contains_key(*id)) {
            return Ok(false);
        }
        for id in ids {
            holds.insert(id.to_string(), owner.to_string());
        }
        Ok(true)
    }

    async fn release(&self, ids: &[&str], owner: &str) -> Result<()> {
        let mut holds = self.holds.lock().await;
        for id in ids {
            if holds.get(*id).map(String::as_str) == Some(owner) {
                holds.remove(*id);
            }
        }
        Ok(())
    }
}

/// Lock store shared by every process using the same database
pub struct PostgresOrderLock {
    pool: PgPool,
}

impl PostgresOrderLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn owned(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[async_trait]
impl OrderLock for PostgresOrderLock {
    async fn lock(&self, ids: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "INSERT INTO settle_lock_refs (order_id, refs) VALUES ($1, 1)
                 ON CONFLICT (order_id) DO UPDATE SET refs = settle_lock_refs.refs + 1",
            )
            .bind(*id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unlock(&self, ids: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let removed = sqlx::query("DELETE FROM settle_lock_refs WHERE order_id = $1 AND refs <= 1")
                .bind(*id)
                .execute(&mut *tx)
                .await?;
            if removed.rows_affected() == 0 {
                sqlx::query("UPDATE settle_lock_refs SET refs = refs - 1 WHERE order_id = $1")
                    .bind(*id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_lock(&self, id: &str) -> Result<u64> {
        let refs: Option<i64> = sqlx::query_scalar("SELECT refs FROM settle_lock_refs WHERE order_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(refs.unwrap_or(0).max(0) as u64)
    }

    async fn try_acquire(&self, ids: &[&str], owner: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO settle_lock_holds (order_id, owner)
             SELECT id, $2 FROM UNNEST($1::text[]) AS id
             ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(owned(ids))
        .bind(owner)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() as usize == ids.len() {
            tx.commit().await?;
            Ok(true)
        } else {
            tx.rollback().await?;
            Ok(false)
        }
    }

    async fn release(&self, ids: &[&str], owner: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM settle_lock_holds WHERE order_id = ANY($1) AND owner = $2")
            .bind(owned(ids))
            .bind(owner)
            .execute(&self.pool)
            .await?;
        if (result.rows_affected() as usize) < ids.len() {
            return Err(Error::Internal(format!(
                "released {} of {} holds for {}",
                result.rows_affected(),
                ids.len(),
                owner
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registrations_are_counted() {
        let lock = InMemoryOrderLock::new();
        lock.lock(&["A1", "B1"]).await.unwrap();
        lock.lock(&["A2", "B1"]).await.unwrap();

        assert_eq!(lock.get_lock("B1").await.unwrap(), 2);
        assert_eq!(lock.state("A1").await.unwrap(), LockState::Held);

        lock.unlock(&["A1", "B1"]).await.unwrap();
        assert_eq!(lock.get_lock("B1").await.unwrap(), 1);
        assert_eq!(lock.state("A1").await.unwrap(), LockState::Free);

        // extra unlocks never go below zero
        lock.unlock(&["A1"]).await.unwrap();
        assert_eq!(lock.get_lock("A1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn holds_are_all_or_nothing() {
        let lock = InMemoryOrderLock::new();
        assert!(lock.try_acquire(&["A1", "B1"], "t1").await.unwrap());
        assert!(!lock.try_acquire(&["A2", "B1"], "t2").await.unwrap());
        assert_eq!(lock.holder("A2").await, None);

        // only the owner can release
        lock.release(&["A1", "B1"], "t2").await.unwrap();
        assert_eq!(lock.holder("B1").await.as_deref(), Some("t1"));

        lock.release(&["A1", "B1"], "t1").await.unwrap();
        assert!(lock.try_acquire(&["A2", "B1"], "t2").await.unwrap());
    }
}
