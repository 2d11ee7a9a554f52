//! Settlement of matched trades
//!
//! Trade results popped from the per-symbol queues are registered on the
//! order lock, settled one leg per task and forwarded to the quote queue.

pub mod clearing;
pub mod config;
pub mod lock;
pub mod pipeline;
pub mod scheduler;
pub mod wait;

pub use clearing::Clearing;
pub use config::SettlementConfig;
pub use lock::{InMemoryOrderLock, LockState, OrderLock, PostgresOrderLock};
pub use pipeline::{LegOutcome, SettlementPipeline};
pub use scheduler::SettlementScheduler;
pub use wait::Backoff;
