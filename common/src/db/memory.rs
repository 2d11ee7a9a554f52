//! In-memory tables backing the in-memory repositories
//!
//! All in-memory repositories share one [`SharedMemoryState`]. A transaction
//! holds the state's mutex for its whole lifetime and works on a copy, so a
//! rollback (or a dropped transaction) leaves the shared state untouched.
//! The copy makes each transaction cost grow with the tables, so this
//! backend is for tests and demos only.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::model::account::{AssetLog, Balance, FreezeRecord};
use crate::model::order::{Order, PendingDispatch, UnfinishedOrder};
use crate::model::trade::TradeLog;

/// Shared handle to the in-memory tables
pub type SharedMemoryState = Arc<Mutex<MemoryState>>;

/// Every table the in-memory backends need
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    /// Balances by (user id, asset)
    pub balances: HashMap<(String, String), Balance>,
    /// Freeze records by (asset, reference id)
    pub freezes: HashMap<(String, String), FreezeRecord>,
    pub asset_logs: Vec<AssetLog>,
    /// Orders by order id
    pub orders: HashMap<String, Order>,
    /// Open-order projections by order id
    pub unfinished: HashMap<String, UnfinishedOrder>,
    /// Trade logs by trade id
    pub trade_logs: HashMap<String, TradeLog>,
    /// Dispatch outbox by insertion id
    pub outbox: BTreeMap<i64, PendingDispatch>,
    pub next_outbox_id: i64,
}

impl MemoryState {
    /// Create an empty shared state
    pub fn shared() -> SharedMemoryState {
        Arc::new(Mutex::new(MemoryState::default()))
    }
}
