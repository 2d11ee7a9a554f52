//! Common types and utilities for the exchange core
//!
//! This library contains shared types, utilities, and abstractions used by
//! order submission, the asset ledger and the settlement pipeline. It
//! provides a unified approach to error handling, transactions, message
//! queues and domain models.

pub mod error;
pub mod model;
pub mod decimal;
pub mod db;
pub mod queue;
pub mod registry;

/// Re-export important types
pub use error::{Error, Result, ErrorExt};
pub use decimal::*;

// Re-export database types
pub use db::transaction::{DBTransaction, TransactionManager};
pub use queue::{MessageQueue, QueueKey};
pub use registry::VarietyRegistry;
