use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

use crate::error::{Error, Result};
use crate::model::account::{Balance, FreezeRecord};
use crate::model::order::{Order, PendingDispatch, UnfinishedOrder};
use crate::model::trade::TradeLog;
use crate::model::variety::TradingVariety;

/// Database model for the assets table
#[derive(Debug, Clone, FromRow)]
pub struct DbBalance {
    pub user_id: String,
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
    pub frozen: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<DbBalance> for Balance {
    fn from(row: DbBalance) -> Self {
        Balance {
            user_id: row.user_id,
            asset: row.asset,
            total: row.total,
            available: row.available,
            freeze: row.frozen,
            updated_at: row.updated_at,
        }
    }
}

/// Database model for the assets_freeze table
#[derive(Debug, Clone, FromRow)]
pub struct DbFreeze {
    pub user_id: String,
    pub asset: String,
    pub ref_id: String,
    pub original: Decimal,
    pub amount: Decimal,
    pub behavior: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbFreeze> for FreezeRecord {
    type Error = Error;

    fn try_from(row: DbFreeze) -> Result<Self> {
        Ok(FreezeRecord {
            user_id: row.user_id,
            asset: row.asset,
            ref_id: row.ref_id,
            original: row.original,
            amount: row.amount,
            behavior: row.behavior.parse()?,
            context: row.context,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database model for the orders table
#[derive(Debug, Clone, FromRow)]
pub struct DbOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub user_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub amount: Decimal,
    pub avg_price: Decimal,
    pub finished_qty: Decimal,
    pub finished_amount: Decimal,
    pub fee_rate: Decimal,
    pub fee: Decimal,
    pub freeze_qty: Decimal,
    pub freeze_amount: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbOrder> for Order {
    type Error = Error;

    fn try_from(row: DbOrder) -> Result<Self> {
        Ok(Order {
            order_id: row.order_id,
            symbol: row.symbol,
            side: row.side.parse()?,
            order_type: row.order_type.parse()?,
            user_id: row.user_id,
            price: row.price,
            quantity: row.quantity,
            amount: row.amount,
            avg_price: row.avg_price,
            finished_qty: row.finished_qty,
            finished_amount: row.finished_amount,
            fee_rate: row.fee_rate,
            fee: row.fee,
            freeze_qty: row.freeze_qty,
            freeze_amount: row.freeze_amount,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database model for the unfinished_orders table
#[derive(Debug, Clone, FromRow)]
pub struct DbUnfinishedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub user_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbUnfinishedOrder> for UnfinishedOrder {
    type Error = Error;

    fn try_from(row: DbUnfinishedOrder) -> Result<Self> {
        Ok(UnfinishedOrder {
            order_id: row.order_id,
            symbol: row.symbol,
            side: row.side.parse()?,
            order_type: row.order_type.parse()?,
            user_id: row.user_id,
            price: row.price,
            quantity: row.quantity,
            amount: row.amount,
            created_at: row.created_at,
        })
    }
}

/// Database model for the trade_logs table
#[derive(Debug, Clone, FromRow)]
pub struct DbTradeLog {
    pub trade_id: String,
    pub symbol: String,
    pub ask_order_id: String,
    pub bid_order_id: String,
    pub ask_user_id: String,
    pub bid_user_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub amount: Decimal,
    pub ask_fee: Decimal,
    pub bid_fee: Decimal,
    pub taker: String,
    pub trade_time: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbTradeLog> for TradeLog {
    type Error = Error;

    fn try_from(row: DbTradeLog) -> Result<Self> {
        Ok(TradeLog {
            trade_id: row.trade_id,
            symbol: row.symbol,
            ask_order_id: row.ask_order_id,
            bid_order_id: row.bid_order_id,
            ask_user_id: row.ask_user_id,
            bid_user_id: row.bid_user_id,
            price: row.price,
            quantity: row.quantity,
            amount: row.amount,
            ask_fee: row.ask_fee,
            bid_fee: row.bid_fee,
            taker: row.taker.parse()?,
            trade_time: row.trade_time,
            created_at: row.created_at,
        })
    }
}

/// Database model for the trading_varieties table
#[derive(Debug, Clone, FromRow)]
pub struct DbTradingVariety {
    pub symbol: String,
    pub target_asset: String,
    pub base_asset: String,
    pub fee_rate: Decimal,
    pub price_precision: i32,
    pub qty_precision: i32,
    pub enabled: bool,
}

impl From<DbTradingVariety> for TradingVariety {
    fn from(row: DbTradingVariety) -> Self {
        TradingVariety {
            symbol: row.symbol,
            target_asset: row.target_asset,
            base_asset: row.base_asset,
            fee_rate: row.fee_rate,
            price_precision: row.price_precision.max(0) as u32,
            qty_precision: row.qty_precision.max(0) as u32,
            enabled: row.enabled,
        }
    }
}

/// Database model for the order_outbox table
#[derive(Debug, Clone, FromRow)]
pub struct DbPendingDispatch {
    pub id: i64,
    pub order_id: String,
    pub symbol: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl From<DbPendingDispatch> for PendingDispatch {
    fn from(row: DbPendingDispatch) -> Self {
        PendingDispatch {
            id: row.id,
            order_id: row.order_id,
            symbol: row.symbol,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}
