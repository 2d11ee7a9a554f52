//! Trading pair metadata

use serde::{Deserialize, Serialize};

use crate::decimal::FeeRate;

/// Trading pair as resolved from the registry
///
/// For "usdjpy" the target asset is "usd" and the base asset is "jpy".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingVariety {
    pub symbol: String,
    /// Asset being bought or sold
    pub target_asset: String,
    /// Pricing and settlement asset
    pub base_asset: String,
    pub fee_rate: FeeRate,
    /// Maximum decimal places of a price
    pub price_precision: u32,
    /// Maximum decimal places of a quantity
    pub qty_precision: u32,
    pub enabled: bool,
}

impl TradingVariety {
    pub fn new(
        symbol: impl Into<String>,
        target_asset: impl Into<String>,
        base_asset: impl Into<String>,
        fee_rate: FeeRate,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            target_asset: target_asset.into(),
            base_asset: base_asset.into(),
            fee_rate,
            price_precision: crate::decimal::precision::PRICE_PRECISION,
            qty_precision: crate::decimal::precision::QUANTITY_PRECISION,
            enabled: true,
        }
    }
}
