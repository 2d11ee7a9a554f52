//! Error types for the exchange core
//!
//! This module provides a unified error handling system shared by order
//! submission, the asset ledger and the settlement pipeline. The variants
//! follow the failure taxonomy of the system: rejections that happen before
//! any side effect, persistence failures that roll a transaction back, and
//! pipeline-only conditions such as malformed events or dependency stalls.

use std::fmt::Display;
use thiserror::Error;

/// Exchange core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown or disabled trading pair
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Order request failed validation
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// The ledger rejected a freeze or a transfer
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Error when an order cannot be found
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Unparseable or invalid queue message
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// A lock or a dependency was not released within the wait budget
    #[error("Dependency stall: {0}")]
    DependencyStall(String),

    /// The trade result was already applied
    #[error("Trade already settled: {0}")]
    AlreadySettled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Transaction or query failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Database migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decimal conversion error
    #[error("Decimal conversion error: {0}")]
    DecimalError(String),
}

impl Error {
    /// Whether the error was raised before any state was touched
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidSymbol(_) | Error::InvalidOrder(_) | Error::InsufficientBalance(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait to add context to error results
pub trait ErrorExt<T> {
    /// Add context information to an error
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T> ErrorExt<T> for Result<T> {
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        self.map_err(|e| {
            let context = context_fn().to_string();
            match e {
                Error::InvalidSymbol(msg) => Error::InvalidSymbol(format!("{}: {}", context, msg)),
                Error::InvalidOrder(msg) => Error::InvalidOrder(format!("{}: {}", context, msg)),
                Error::InsufficientBalance(msg) => Error::InsufficientBalance(format!("{}: {}", context, msg)),
                Error::OrderNotFound(msg) => Error::OrderNotFound(format!("{}: {}", context, msg)),
                Error::MalformedEvent(msg) => Error::MalformedEvent(format!("{}: {}", context, msg)),
                Error::DependencyStall(msg) => Error::DependencyStall(format!("{}: {}", context, msg)),
                Error::AlreadySettled(msg) => Error::AlreadySettled(format!("{}: {}", context, msg)),
                Error::ConfigurationError(msg) => Error::ConfigurationError(format!("{}: {}", context, msg)),
                Error::Internal(msg) => Error::Internal(format!("{}: {}", context, msg)),
                Error::Persistence(e) => Error::Persistence(e),
                Error::Migration(e) => Error::Migration(e),
                Error::Serialization(e) => Error::Serialization(e),
                Error::DecimalError(msg) => Error::DecimalError(format!("{}: {}", context, msg)),
            }
        })
    }
}

/// Convert string messages into an error
impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Internal(message)
    }
}

/// Convert static string references into an error
impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Internal(message.to_string())
    }
}

/// From rust_decimal::Error
impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::DecimalError(err.to_string())
    }
}
