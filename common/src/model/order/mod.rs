//! Order models and related types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::{Amount, FeeRate, Price, Quantity};
use crate::error::{Error, Result};

/// Wire schema version of [`OrderDescriptor`]
pub const ORDER_DESCRIPTOR_VERSION: u8 = 1;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Prefix used for order ids: `A` (ask) for sells, `B` (bid) for buys
    pub fn id_prefix(&self) -> char {
        match self {
            Side::Sell => 'A',
            Side::Buy => 'B',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(Error::InvalidOrder(format!("unknown side {}", other))),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Rests on the book at a limit price
    Limit,
    /// Market order sized by target-asset quantity
    MarketQty,
    /// Market order sized by base-asset amount
    MarketAmount,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::MarketQty => "market_qty",
            OrderType::MarketAmount => "market_amount",
        }
    }

    pub fn is_market(&self) -> bool {
        !matches!(self, OrderType::Limit)
    }
}

impl std::str::FromStr for OrderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "limit" => Ok(OrderType::Limit),
            "market_qty" => Ok(OrderType::MarketQty),
            "market_amount" => Ok(OrderType::MarketAmount),
            other => Err(Error::InvalidOrder(format!("unknown order type {}", other))),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepted and reserved, not matched yet
    New,
    /// Some legs settled, residual still open
    PartiallyFilled,
    /// Terminal: fully settled
    Filled,
    /// Terminal: residual released without trading
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Filled | Status::Cancelled)
    }

    /// Status transitions only move forward
    pub fn can_transition_to(&self, next: Status) -> bool {
        match (self, next) {
            (Status::New, Status::New) => true,
            (Status::New | Status::PartiallyFilled, Status::PartiallyFilled) => true,
            (Status::New | Status::PartiallyFilled, Status::Filled) => true,
            (Status::New | Status::PartiallyFilled, Status::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "new",
            Status::PartiallyFilled => "partially_filled",
            Status::Filled => "filled",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(Status::New),
            "partially_filled" => Ok(Status::PartiallyFilled),
            "filled" => Ok(Status::Filled),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(Error::Internal(format!("unknown order status {}", other))),
        }
    }
}

/// Order model
///
/// `freeze_qty` / `freeze_amount` hold the reservation still outstanding
/// for the order; they only ever shrink after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Side-prefixed order id
    pub order_id: String,
    /// Trading pair symbol, e.g. "usdjpy"
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Owner
    pub user_id: String,
    /// Limit price, zero for market orders
    pub price: Price,
    /// Requested quantity, zero for amount-sized market orders
    pub quantity: Quantity,
    /// Requested amount, zero unless amount-sized
    pub amount: Amount,
    /// Volume-weighted average fill price
    pub avg_price: Price,
    pub finished_qty: Quantity,
    pub finished_amount: Amount,
    /// Fee rate snapshot taken at creation
    pub fee_rate: FeeRate,
    /// Cumulative fee charged, in the base asset
    pub fee: Amount,
    /// Outstanding target-asset reservation
    pub freeze_qty: Quantity,
    /// Outstanding base-asset reservation
    pub freeze_amount: Amount,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new order in status `New` with nothing reserved yet
    pub fn new(
        order_id: String,
        symbol: String,
        side: Side,
        order_type: OrderType,
        user_id: String,
        price: Price,
        quantity: Quantity,
        amount: Amount,
        fee_rate: FeeRate,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id,
            symbol,
            side,
            order_type,
            user_id,
            price,
            quantity,
            amount,
            avg_price: Decimal::ZERO,
            finished_qty: Decimal::ZERO,
            finished_amount: Decimal::ZERO,
            fee_rate,
            fee: Decimal::ZERO,
            freeze_qty: Decimal::ZERO,
            freeze_amount: Decimal::ZERO,
            status: Status::New,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Outstanding reservation in whichever asset this order froze
    pub fn frozen(&self) -> Decimal {
        match self.side {
            Side::Sell => self.freeze_qty,
            Side::Buy => self.freeze_amount,
        }
    }

    /// Whether the requested size has been reached
    pub fn target_reached(&self) -> bool {
        match self.order_type {
            OrderType::Limit | OrderType::MarketQty => self.finished_qty >= self.quantity,
            OrderType::MarketAmount => self.finished_amount >= self.amount,
        }
    }

    /// Record one settled leg: quantity, amount, fee and running average price
    pub fn apply_fill(&mut self, quantity: Quantity, amount: Amount, fee: Amount) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidOrder(format!(
                "order {} is {} and cannot take more fills",
                self.order_id,
                self.status.as_str()
            )));
        }
        if quantity <= Decimal::ZERO || amount <= Decimal::ZERO || fee < Decimal::ZERO {
            return Err(Error::InvalidOrder(format!(
                "non-positive fill for order {}",
                self.order_id
            )));
        }
        let sized_by_qty = matches!(self.order_type, OrderType::Limit | OrderType::MarketQty);
        if sized_by_qty && self.finished_qty + quantity > self.quantity {
            return Err(Error::InvalidOrder(format!(
                "fill of {} overruns order {}: {} of {} already filled",
                quantity, self.order_id, self.finished_qty, self.quantity
            )));
        }
        self.finished_qty += quantity;
        self.finished_amount += amount;
        self.fee += fee;
        self.avg_price = self.finished_amount / self.finished_qty;
        Ok(())
    }

    /// Reduce the outstanding reservation, never below zero
    pub fn consume_freeze(&mut self, value: Decimal) -> Result<()> {
        let frozen = match self.side {
            Side::Sell => &mut self.freeze_qty,
            Side::Buy => &mut self.freeze_amount,
        };
        if value > *frozen {
            return Err(Error::InsufficientBalance(format!(
                "order {} has {} frozen, leg needs {}",
                self.order_id, frozen, value
            )));
        }
        *frozen -= value;
        Ok(())
    }

    /// Drop whatever reservation is left, returning its size
    pub fn clear_freeze(&mut self) -> Decimal {
        let residual = self.frozen();
        self.freeze_qty = Decimal::ZERO;
        self.freeze_amount = Decimal::ZERO;
        residual
    }

    /// Move to `next`, rejecting backwards transitions
    pub fn transition(&mut self, next: Status) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidOrder(format!(
                "order {} cannot move from {} to {}",
                self.order_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Creation time in nanoseconds since the epoch
    pub fn created_at_nanos(&self) -> i64 {
        self.created_at.timestamp_nanos_opt().unwrap_or_default()
    }
}

/// Projection of an [`Order`] that exists only while the order is open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfinishedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub user_id: String,
    pub price: Price,
    pub quantity: Quantity,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for UnfinishedOrder {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            user_id: order.user_id.clone(),
            price: order.price,
            quantity: order.quantity,
            amount: order.amount,
            created_at: order.created_at,
        }
    }
}

/// Normalized order descriptor published to the matching engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderDescriptor {
    pub v: u8,
    pub order_id: String,
    pub order_type: OrderType,
    pub side: Side,
    pub price: Price,
    pub qty: Quantity,
    /// Quantity ceiling the matcher may fill
    pub max_qty: Quantity,
    pub amount: Amount,
    /// Amount ceiling the matcher may spend
    pub max_amount: Amount,
    /// Creation time, nanoseconds
    pub at: i64,
}

impl OrderDescriptor {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let descriptor: OrderDescriptor = serde_json::from_slice(raw)
            .map_err(|e| Error::MalformedEvent(format!("order descriptor: {}", e)))?;
        if descriptor.v != ORDER_DESCRIPTOR_VERSION {
            return Err(Error::MalformedEvent(format!(
                "unsupported order descriptor version {}",
                descriptor.v
            )));
        }
        Ok(descriptor)
    }
}

/// Order committed but not yet confirmed as published to the matcher
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDispatch {
    pub id: i64,
    pub order_id: String,
    pub symbol: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}
