//! Process configuration for the trading engine binary

use std::env;
use std::time::Duration;

use account_service::AccountServiceConfig;
use clap::ValueEnum;
use settlement::SettlementConfig;

/// Storage behind repositories, queues and the order lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Postgres,
    /// Single-process tables for tests and demos
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(Backend::Postgres),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown backend {}", other)),
        }
    }
}

/// Configuration of the trading engine process
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: Backend,
    /// Run database migrations before starting
    pub run_migrations: bool,
    /// How often the dispatch outbox is swept
    pub outbox_interval: Duration,
    /// Outbox rows younger than this are left to the placing request
    pub outbox_min_age: Duration,
    /// Rows republished per sweep
    pub outbox_batch: i64,
    pub account: AccountServiceConfig,
    pub settlement: SettlementConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let secs = |name: &str, default: u64| {
            Duration::from_secs(env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default))
        };

        Self {
            backend: env::var("ENGINE_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Backend::Postgres),
            run_migrations: env::var("RUN_MIGRATIONS").map(|v| v == "1" || v == "true").unwrap_or(false),
            outbox_interval: secs("OUTBOX_INTERVAL_SECS", 10),
            outbox_min_age: secs("OUTBOX_MIN_AGE_SECS", 5),
            outbox_batch: env::var("OUTBOX_BATCH").ok().and_then(|s| s.parse().ok()).unwrap_or(100),
            account: AccountServiceConfig::from_env(),
            settlement: SettlementConfig::from_env(),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration using environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Minimum outbox age as a chrono duration
    pub fn outbox_min_age(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.outbox_min_age).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert_eq!("Postgres".parse::<Backend>().unwrap(), Backend::Postgres);
        assert!("redis".parse::<Backend>().is_err());
    }

    #[test]
    fn outbox_age_converts() {
        let mut config = EngineConfig::default();
        config.outbox_min_age = Duration::from_secs(7);
        assert_eq!(config.outbox_min_age(), chrono::Duration::seconds(7));
    }
}
