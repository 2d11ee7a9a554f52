//! Asset ledger implementation
//!
//! Every mutating operation other than [`AccountService::deposit`] runs inside
//! a caller supplied transaction, so order placement and settlement can make
//! their ledger movements atomic with their own writes.

use std::sync::Arc;

use chrono::Utc;
use common::db::{init_db_pool, SharedMemoryState};
use common::decimal::Quantity;
use common::error::{Error, ErrorExt, Result};
use common::model::account::{AssetLog, Balance, Behavior, FreezeRecord};
use common::DBTransaction;
use sqlx::PgPool;
use tracing::{debug, error, info};

use crate::config::AccountServiceConfig;
use crate::repository::{AccountRepository, InMemoryAccountRepository, PostgresAccountRepository};

/// Account service owning user balances and freeze records
pub struct AccountService {
    /// Repository for ledger data
    repo: Arc<dyn AccountRepository>,
    /// User credited with trading fees
    system_fee_user: String,
}

/// Repository Type
pub enum RepositoryType {
    /// In-memory repository over shared tables
    InMemory(SharedMemoryState),
    /// PostgreSQL repository
    Postgres(PgPool),
}

impl AccountService {
    /// Create a new account service over a repository
    pub fn new(repo: Arc<dyn AccountRepository>, system_fee_user: impl Into<String>) -> Self {
        Self {
            repo,
            system_fee_user: system_fee_user.into(),
        }
    }

    /// Create an in-memory account service with the default fee account
    pub fn in_memory(state: SharedMemoryState) -> Self {
        Self::new(Arc::new(InMemoryAccountRepository::new(state)), "sys_fee")
    }

    /// Create a new account service with a specific repository type
    pub fn with_repository(repo_type: RepositoryType, config: &AccountServiceConfig) -> Self {
        let repo: Arc<dyn AccountRepository> = match repo_type {
            RepositoryType::InMemory(state) => Arc::new(InMemoryAccountRepository::new(state)),
            RepositoryType::Postgres(pool) => Arc::new(PostgresAccountRepository::new(pool)),
        };

        Self::new(repo, config.system_fee_user.clone())
    }

    /// Create a new account service connected to the configured database
    pub async fn with_config(config: &AccountServiceConfig) -> Result<Self> {
        let pool = init_db_pool(&config.database_url, config.db_pool_size).await?;
        Ok(Self::with_repository(RepositoryType::Postgres(pool), config))
    }

    /// User credited with trading fees
    pub fn system_fee_user(&self) -> &str {
        &self.system_fee_user
    }

    /// Begin a ledger transaction
    pub async fn begin_transaction(&self) -> Result<DBTransaction> {
        self.repo.begin_transaction().await
    }

    /// Get a balance, zero if the user never held the asset
    pub async fn get_balance(&self, user_id: &str, asset: &str) -> Result<Balance> {
        Ok(self
            .repo
            .get_balance(user_id, asset)
            .await?
            .unwrap_or_else(|| Balance::new(user_id.to_string(), asset.to_string())))
    }

    /// Get all balances for a user
    pub async fn get_balances(&self, user_id: &str) -> Result<Vec<Balance>> {
        self.repo.get_balances(user_id).await
    }

    /// Lock several balance rows in a fixed order before touching any of them
    pub async fn lock_balances(&self, tx: &mut DBTransaction, keys: &[(&str, &str)]) -> Result<()> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        for (user_id, asset) in keys {
            self.repo
                .balance_for_update(tx, user_id, asset)
                .await
                .with_context(|| format!("Failed to lock {} balance of {}", asset, user_id))?;
        }
        Ok(())
    }

    /// Deposit funds, in a transaction of its own
    pub async fn deposit(&self, user_id: &str, asset: &str, amount: Quantity, ref_id: &str) -> Result<Balance> {
        if amount <= Quantity::ZERO {
            return Err(Error::Internal(format!("Deposit amount must be positive: {}", amount)));
        }
        info!("Depositing {} {} to user {}", amount, asset, user_id);

        let mut tx = self.repo.begin_transaction().await
            .with_context(|| format!("Failed to start transaction for deposit {}", ref_id))?;

        let result = async {
            let mut balance = self.repo.balance_for_update(&mut tx, user_id, asset).await?;
            balance.deposit(amount);
            self.repo.save_balance(&mut tx, &balance).await?;
            self.log(&mut tx, user_id, asset, amount, Quantity::ZERO, ref_id, Behavior::Deposit).await?;
            Ok::<_, Error>(balance)
        }
        .await;

        match result {
            Ok(balance) => {
                tx.commit().await
                    .with_context(|| format!("Failed to commit deposit {}", ref_id))?;
                Ok(balance)
            }
            Err(e) => {
                error!("Error depositing {} {} to {}: {}", amount, asset, user_id, e);
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Reserve `amount` of a balance under `ref_id`
    pub async fn freeze(
        &self,
        tx: &mut DBTransaction,
        user_id: &str,
        asset: &str,
        amount: Quantity,
        ref_id: &str,
        context: &str,
    ) -> Result<FreezeRecord> {
        if amount <= Quantity::ZERO {
            return Err(Error::InsufficientBalance(format!(
                "Cannot freeze {} {} for {}", amount, asset, ref_id
            )));
        }
        if self.repo.get_freeze(tx, asset, ref_id).await?.is_some() {
            return Err(Error::Internal(format!("Duplicate freeze of {} for {}", asset, ref_id)));
        }

        let mut balance = self.repo.balance_for_update(tx, user_id, asset).await?;
        balance.freeze(amount).map_err(|e| {
            Error::InsufficientBalance(format!("Cannot freeze {} {} for {}: {}", amount, asset, ref_id, e))
        })?;
        self.repo.save_balance(tx, &balance).await?;

        let now = Utc::now();
        let record = FreezeRecord {
            user_id: user_id.to_string(),
            asset: asset.to_string(),
            ref_id: ref_id.to_string(),
            original: amount,
            amount,
            behavior: Behavior::Trade,
            context: context.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.repo.save_freeze(tx, &record).await?;
        self.log(tx, user_id, asset, -amount, amount, ref_id, Behavior::Freeze).await?;

        debug!("Froze {} {} of {} for {}", amount, asset, user_id, ref_id);
        Ok(record)
    }

    /// Reserve the entire available balance under `ref_id`
    pub async fn freeze_all(
        &self,
        tx: &mut DBTransaction,
        user_id: &str,
        asset: &str,
        ref_id: &str,
        context: &str,
    ) -> Result<FreezeRecord> {
        let balance = self.repo.balance_for_update(tx, user_id, asset).await?;
        if balance.available <= Quantity::ZERO {
            return Err(Error::InsufficientBalance(format!(
                "No {} available for user {}", asset, user_id
            )));
        }
        self.freeze(tx, user_id, asset, balance.available, ref_id, context).await
    }

    /// Read the freeze record of `ref_id`
    pub async fn query_freeze(&self, tx: &mut DBTransaction, asset: &str, ref_id: &str) -> Result<FreezeRecord> {
        self.repo
            .get_freeze(tx, asset, ref_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("No {} freeze found for {}", asset, ref_id)))
    }

    /// Return reserved funds to the available balance
    ///
    /// Releases everything still reserved when `amount` is `None`. Returns the
    /// amount released.
    pub async fn unfreeze(
        &self,
        tx: &mut DBTransaction,
        asset: &str,
        ref_id: &str,
        amount: Option<Quantity>,
    ) -> Result<Quantity> {
        let mut record = self.query_freeze(tx, asset, ref_id).await?;
        let release = amount.unwrap_or(record.amount);
        if release > record.amount {
            return Err(Error::InsufficientBalance(format!(
                "Cannot release {} {} for {}, {} reserved", release, asset, ref_id, record.amount
            )));
        }
        if release <= Quantity::ZERO {
            return Ok(Quantity::ZERO);
        }

        let mut balance = self.repo.balance_for_update(tx, &record.user_id, asset).await?;
        balance.unfreeze(release).map_err(Error::InsufficientBalance)?;
        self.repo.save_balance(tx, &balance).await?;

        record.amount -= release;
        record.updated_at = Utc::now();
        self.repo.save_freeze(tx, &record).await?;
        self.log(tx, &record.user_id, asset, release, -release, ref_id, Behavior::Unfreeze).await?;

        debug!("Released {} {} of {} for {}", release, asset, record.user_id, ref_id);
        Ok(release)
    }

    /// Move reserved funds of `ref_id` to another user's available balance
    pub async fn transfer_from_freeze(
        &self,
        tx: &mut DBTransaction,
        asset: &str,
        ref_id: &str,
        to_user: &str,
        amount: Quantity,
        behavior: Behavior,
    ) -> Result<()> {
        if amount <= Quantity::ZERO {
            return Ok(());
        }

        let mut record = self.query_freeze(tx, asset, ref_id).await?;
        if amount > record.amount {
            return Err(Error::InsufficientBalance(format!(
                "Cannot take {} {} from {}, {} reserved", amount, asset, ref_id, record.amount
            )));
        }

        let mut from = self.repo.balance_for_update(tx, &record.user_id, asset).await?;
        from.withdraw_frozen(amount).map_err(Error::InsufficientBalance)?;
        self.repo.save_balance(tx, &from).await?;

        let mut to = self.repo.balance_for_update(tx, to_user, asset).await?;
        to.deposit(amount);
        self.repo.save_balance(tx, &to).await?;

        record.amount -= amount;
        record.updated_at = Utc::now();
        self.repo.save_freeze(tx, &record).await?;

        self.log(tx, &record.user_id, asset, Quantity::ZERO, -amount, ref_id, behavior).await?;
        self.log(tx, to_user, asset, amount, Quantity::ZERO, ref_id, behavior).await?;
        Ok(())
    }

    /// Move available funds between users
    #[allow(clippy::too_many_arguments)]
    pub async fn transfer(
        &self,
        tx: &mut DBTransaction,
        from_user: &str,
        to_user: &str,
        asset: &str,
        amount: Quantity,
        ref_id: &str,
        behavior: Behavior,
    ) -> Result<()> {
        if amount <= Quantity::ZERO {
            return Ok(());
        }

        let mut from = self.repo.balance_for_update(tx, from_user, asset).await?;
        from.withdraw(amount).map_err(Error::InsufficientBalance)?;
        self.repo.save_balance(tx, &from).await?;

        let mut to = self.repo.balance_for_update(tx, to_user, asset).await?;
        to.deposit(amount);
        self.repo.save_balance(tx, &to).await?;

        self.log(tx, from_user, asset, -amount, Quantity::ZERO, ref_id, behavior).await?;
        self.log(tx, to_user, asset, amount, Quantity::ZERO, ref_id, behavior).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn log(
        &self,
        tx: &mut DBTransaction,
        user_id: &str,
        asset: &str,
        change_available: Quantity,
        change_freeze: Quantity,
        ref_id: &str,
        behavior: Behavior,
    ) -> Result<()> {
        let entry = AssetLog {
            user_id: user_id.to_string(),
            asset: asset.to_string(),
            change_available,
            change_freeze,
            ref_id: ref_id.to_string(),
            behavior,
            created_at: Utc::now(),
        };
        self.repo.append_log(tx, &entry).await
    }
}
