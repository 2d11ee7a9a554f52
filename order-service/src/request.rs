//! Order requests and their pre-inspection

use chrono::{DateTime, Utc};
use common::decimal::{precision, Amount, Price, Quantity};
use common::error::{Error, Result};
use common::model::order::{OrderType, Side};
use common::model::variety::TradingVariety;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An order intent as submitted by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price, limit orders only
    #[serde(default)]
    pub price: Option<Price>,
    /// Target-asset quantity, limit and market-by-quantity orders
    #[serde(default)]
    pub quantity: Option<Quantity>,
    /// Base-asset amount, market-by-amount orders
    #[serde(default)]
    pub amount: Option<Amount>,
}

impl PlaceOrderRequest {
    pub fn limit(user_id: &str, symbol: &str, side: Side, price: Price, quantity: Quantity) -> Self {
        Self {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity: Some(quantity),
            amount: None,
        }
    }

    pub fn market_by_qty(user_id: &str, symbol: &str, side: Side, quantity: Quantity) -> Self {
        Self {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::MarketQty,
            price: None,
            quantity: Some(quantity),
            amount: None,
        }
    }

    pub fn market_by_amount(user_id: &str, symbol: &str, side: Side, amount: Amount) -> Self {
        Self {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::MarketAmount,
            price: None,
            quantity: None,
            amount: Some(amount),
        }
    }

    /// Check the request against the trading pair before anything is reserved
    pub fn validate(&self, variety: &TradingVariety) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::InvalidOrder("missing user id".to_string()));
        }

        match self.order_type {
            OrderType::Limit => {
                let price = positive("price", self.price)?;
                let quantity = positive("quantity", self.quantity)?;
                absent("amount", self.amount)?;
                fits("price", price, variety.price_precision)?;
                fits("quantity", quantity, variety.qty_precision)?;
            }
            OrderType::MarketQty => {
                absent("price", self.price)?;
                absent("amount", self.amount)?;
                let quantity = positive("quantity", self.quantity)?;
                fits("quantity", quantity, variety.qty_precision)?;
            }
            OrderType::MarketAmount => {
                absent("price", self.price)?;
                absent("quantity", self.quantity)?;
                let amount = positive("amount", self.amount)?;
                fits("amount", amount, variety.price_precision)?;
            }
        }
        Ok(())
    }
}

fn positive(field: &str, value: Option<Decimal>) -> Result<Decimal> {
    match value {
        Some(v) if v > Decimal::ZERO => Ok(v),
        Some(v) => Err(Error::InvalidOrder(format!("{} must be positive, got {}", field, v))),
        None => Err(Error::InvalidOrder(format!("missing {}", field))),
    }
}

fn absent(field: &str, value: Option<Decimal>) -> Result<()> {
    match value {
        Some(v) if !v.is_zero() => Err(Error::InvalidOrder(format!("unexpected {} {}", field, v))),
        _ => Ok(()),
    }
}

fn fits(field: &str, value: Decimal, dp: u32) -> Result<()> {
    if !precision::fits(value, dp) {
        return Err(Error::InvalidOrder(format!(
            "{} {} exceeds {} decimal places",
            field, value, dp
        )));
    }
    Ok(())
}

/// Side-prefixed order id: `A`/`B`, UTC `yyMMddHHmmss`, 12 random hex chars
pub fn generate_order_id(side: Side, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}{}{}", side.id_prefix(), now.format("%y%m%d%H%M%S"), &random[..12])
}
