//! Trading pair registry interface
//!
//! The registry is owned elsewhere; this core only reads from it.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;

use crate::db::models::DbTradingVariety;
use crate::error::Result;
use crate::model::variety::TradingVariety;

#[async_trait]
pub trait VarietyRegistry: Send + Sync {
    /// Look a symbol up, enabled or not
    async fn resolve(&self, symbol: &str) -> Result<Option<TradingVariety>>;

    /// Every enabled trading pair
    async fn all_enabled(&self) -> Result<Vec<TradingVariety>>;
}

/// In-memory registry
#[derive(Default)]
pub struct InMemoryVarietyRegistry {
    varieties: DashMap<String, TradingVariety>,
}

impl InMemoryVarietyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a trading pair
    pub fn insert(&self, variety: TradingVariety) {
        self.varieties.insert(variety.symbol.clone(), variety);
    }
}

#[async_trait]
impl VarietyRegistry for InMemoryVarietyRegistry {
    async fn resolve(&self, symbol: &str) -> Result<Option<TradingVariety>> {
        Ok(self.varieties.get(symbol).map(|v| v.clone()))
    }

    async fn all_enabled(&self) -> Result<Vec<TradingVariety>> {
        let mut all: Vec<TradingVariety> = self
            .varieties
            .iter()
            .filter(|v| v.enabled)
            .map(|v| v.clone())
            .collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(all)
    }
}

/// Registry read from the trading_varieties table
pub struct PostgresVarietyRegistry {
    pool: PgPool,
}

impl PostgresVarietyRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VarietyRegistry for PostgresVarietyRegistry {
    async fn resolve(&self, symbol: &str) -> Result<Option<TradingVariety>> {
        let row = sqlx::query_as::<_, DbTradingVariety>(
            "SELECT symbol, target_asset, base_asset, fee_rate, price_precision, qty_precision, enabled
             FROM trading_varieties
             WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TradingVariety::from))
    }

    async fn all_enabled(&self) -> Result<Vec<TradingVariety>> {
        let rows = sqlx::query_as::<_, DbTradingVariety>(
            "SELECT symbol, target_asset, base_asset, fee_rate, price_precision, qty_precision, enabled
             FROM trading_varieties
             WHERE enabled
             ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TradingVariety::from).collect())
    }
}
