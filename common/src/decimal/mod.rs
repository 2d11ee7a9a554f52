//! Decimal type utilities for precise financial calculations

use rust_decimal::{Decimal, RoundingStrategy};
pub use rust_decimal_macros::dec;

/// Price type with high precision
pub type Price = Decimal;

/// Quantity type with high precision
pub type Quantity = Decimal;

/// Amount type with high precision (typically Price * Quantity)
pub type Amount = Decimal;

/// Fee rate, e.g. 0.005 for 0.5%
pub type FeeRate = Decimal;

/// Precision helpers for common operations
pub mod precision {
    use super::*;

    /// Default price precision (8 decimal places)
    pub const PRICE_PRECISION: u32 = 8;

    /// Default quantity precision (8 decimal places)
    pub const QUANTITY_PRECISION: u32 = 8;

    /// Whether `value` has no more than `dp` significant decimal places
    pub fn fits(value: Decimal, dp: u32) -> bool {
        value.normalize().scale() <= dp
    }

    /// Decimal places kept by the ledger and order tables
    pub const STORAGE_SCALE: u32 = 18;

    /// Round a reservation up to storage scale so it always covers what it was sized for
    pub fn reserve(value: Decimal) -> Decimal {
        value.round_dp_with_strategy(STORAGE_SCALE, RoundingStrategy::AwayFromZero)
    }

    /// Round a fee or traded amount down to storage scale
    pub fn settle(value: Decimal) -> Decimal {
        value.round_dp_with_strategy(STORAGE_SCALE, RoundingStrategy::ToZero)
    }
}
