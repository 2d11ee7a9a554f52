//! Asset ledger: balances, freezes and transfers between users

pub mod service;
pub mod repository;
pub mod config;

pub use service::AccountService;
pub use service::RepositoryType;
pub use repository::{AccountRepository, InMemoryAccountRepository, PostgresAccountRepository};
pub use config::AccountServiceConfig;
