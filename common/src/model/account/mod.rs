//! Asset ledger models: balances, freeze records and the movement log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Quantity;

/// Balance model, one row per user and asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: String,
    /// Asset symbol (e.g., "usd", "jpy")
    pub asset: String,
    /// Total balance
    pub total: Quantity,
    /// Available balance (not frozen by orders)
    pub available: Quantity,
    /// Frozen balance
    pub freeze: Quantity,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// Create a new balance with zero amounts
    pub fn new(user_id: String, asset: String) -> Self {
        Self {
            user_id,
            asset,
            total: Quantity::ZERO,
            available: Quantity::ZERO,
            freeze: Quantity::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Move funds from available to frozen
    pub fn freeze(&mut self, amount: Quantity) -> Result<(), String> {
        if amount > self.available {
            return Err(format!("Insufficient balance: {} {}", self.available, self.asset));
        }

        self.available -= amount;
        self.freeze += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move funds from frozen back to available
    pub fn unfreeze(&mut self, amount: Quantity) -> Result<(), String> {
        if amount > self.freeze {
            return Err(format!("Insufficient frozen balance: {} {}", self.freeze, self.asset));
        }

        self.freeze -= amount;
        self.available += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Add funds to the balance
    pub fn deposit(&mut self, amount: Quantity) {
        self.total += amount;
        self.available += amount;
        self.updated_at = Utc::now();
    }

    /// Remove available funds from the balance
    pub fn withdraw(&mut self, amount: Quantity) -> Result<(), String> {
        if amount > self.available {
            return Err(format!("Insufficient available balance: {} {}", self.available, self.asset));
        }

        self.total -= amount;
        self.available -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Remove frozen funds from the balance
    pub fn withdraw_frozen(&mut self, amount: Quantity) -> Result<(), String> {
        if amount > self.freeze {
            return Err(format!("Insufficient frozen balance: {} {}", self.freeze, self.asset));
        }

        self.total -= amount;
        self.freeze -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Reservation made against a balance for one business reference (an order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeRecord {
    pub user_id: String,
    pub asset: String,
    /// Business reference, the order id for trading freezes
    pub ref_id: String,
    /// Amount reserved when the record was created
    pub original: Quantity,
    /// Amount still reserved
    pub amount: Quantity,
    pub behavior: Behavior,
    /// Free-form context, the symbol for trading freezes
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a ledger movement happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Deposit,
    Trade,
    Fee,
    Freeze,
    Unfreeze,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Deposit => "deposit",
            Behavior::Trade => "trade",
            Behavior::Fee => "fee",
            Behavior::Freeze => "freeze",
            Behavior::Unfreeze => "unfreeze",
        }
    }
}

impl std::str::FromStr for Behavior {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "deposit" => Ok(Behavior::Deposit),
            "trade" => Ok(Behavior::Trade),
            "fee" => Ok(Behavior::Fee),
            "freeze" => Ok(Behavior::Freeze),
            "unfreeze" => Ok(Behavior::Unfreeze),
            other => Err(crate::error::Error::Internal(format!("unknown behavior {}", other))),
        }
    }
}

/// Append-only record of one balance movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetLog {
    pub user_id: String,
    pub asset: String,
    pub change_available: Quantity,
    pub change_freeze: Quantity,
    pub ref_id: String,
    pub behavior: Behavior,
    pub created_at: DateTime<Utc>,
}
