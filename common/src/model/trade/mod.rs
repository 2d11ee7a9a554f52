//! Trade models and related types

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::decimal::{Amount, Price, Quantity};
use crate::error::{Error, Result};
use crate::model::order::Side;

/// Wire schema version of [`TradeResult`]
pub const TRADE_RESULT_VERSION: u8 = 1;

/// A match asserted by the matching engine
///
/// `last` carries the id of the incoming order whose batch of legs this
/// result concludes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeResult {
    pub v: u8,
    pub symbol: String,
    pub ask_order_id: String,
    pub bid_order_id: String,
    pub trade_price: Price,
    pub trade_quantity: Quantity,
    /// Nanoseconds since the epoch
    pub trade_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
}

impl TradeResult {
    pub fn new(
        symbol: impl Into<String>,
        ask_order_id: impl Into<String>,
        bid_order_id: impl Into<String>,
        trade_price: Price,
        trade_quantity: Quantity,
        trade_time: i64,
    ) -> Self {
        Self {
            v: TRADE_RESULT_VERSION,
            symbol: symbol.into(),
            ask_order_id: ask_order_id.into(),
            bid_order_id: bid_order_id.into(),
            trade_price,
            trade_quantity,
            trade_time,
            last: None,
        }
    }

    /// Flag this result as the final leg of `order_id`'s batch
    pub fn with_last(mut self, order_id: impl Into<String>) -> Self {
        self.last = Some(order_id.into());
        self
    }

    /// Decode and validate a raw queue payload popped from `symbol`'s queue
    pub fn parse(raw: &[u8], symbol: &str) -> Result<Self> {
        let result: TradeResult = serde_json::from_slice(raw)
            .map_err(|e| Error::MalformedEvent(format!("trade result: {}", e)))?;
        result.validate(symbol)?;
        Ok(result)
    }

    fn validate(&self, symbol: &str) -> Result<()> {
        if self.v != TRADE_RESULT_VERSION {
            return Err(Error::MalformedEvent(format!(
                "unsupported trade result version {}",
                self.v
            )));
        }
        if self.symbol != symbol {
            return Err(Error::MalformedEvent(format!(
                "trade result for {} on the {} queue",
                self.symbol, symbol
            )));
        }
        if self.ask_order_id.is_empty() || self.bid_order_id.is_empty() {
            return Err(Error::MalformedEvent("empty order id".to_string()));
        }
        if self.ask_order_id == self.bid_order_id {
            return Err(Error::MalformedEvent(format!(
                "order {} matched against itself",
                self.ask_order_id
            )));
        }
        if self.trade_price <= Decimal::ZERO || self.trade_quantity <= Decimal::ZERO {
            return Err(Error::MalformedEvent(format!(
                "non-positive trade {} @ {}",
                self.trade_quantity, self.trade_price
            )));
        }
        if matches!(&self.last, Some(last) if last.is_empty()) {
            return Err(Error::MalformedEvent("empty last order id".to_string()));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Price x quantity
    pub fn amount(&self) -> Amount {
        self.trade_price * self.trade_quantity
    }

    /// Both participant ids, ask first
    pub fn order_ids(&self) -> [&str; 2] {
        [self.ask_order_id.as_str(), self.bid_order_id.as_str()]
    }

    /// Deterministic trade id: replays of the same result map to the same id
    pub fn trade_id(&self) -> String {
        let price = self.trade_price.normalize().to_string();
        let quantity = self.trade_quantity.normalize().to_string();

        let mut hasher = Sha256::new();
        for part in [self.ask_order_id.as_str(), self.bid_order_id.as_str(), price.as_str(), quantity.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.trade_time.to_be_bytes());
        let hash = hex::encode(hasher.finalize());
        format!("T{}{}", self.trade_date().format("%y%m%d"), &hash[..17])
    }

    pub fn trade_date(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.trade_time)
    }
}

/// Immutable audit record, one per settled trade result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLog {
    pub trade_id: String,
    pub symbol: String,
    pub ask_order_id: String,
    pub bid_order_id: String,
    pub ask_user_id: String,
    pub bid_user_id: String,
    pub price: Price,
    pub quantity: Quantity,
    pub amount: Amount,
    pub ask_fee: Amount,
    pub bid_fee: Amount,
    /// Side of the order that arrived later and triggered the match
    pub taker: Side,
    pub trade_time: i64,
    pub created_at: DateTime<Utc>,
}
