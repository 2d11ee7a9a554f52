//! Configuration for the settlement pipeline

use std::env;
use std::time::Duration;

/// Configuration for the settlement scheduler and its workers
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Maximum settlement tasks in flight across all symbols
    pub concurrency: usize,
    /// Idle sleep of a worker whose queue is empty
    pub poll_interval: Duration,
    /// How often the set of enabled symbols is re-read
    pub symbol_refresh_interval: Duration,
    /// First backoff step when a lock or dependency is busy
    pub lock_retry_initial: Duration,
    /// Backoff ceiling
    pub lock_retry_max: Duration,
    /// Give up on a lock or dependency after this long
    pub dependency_timeout: Duration,
    /// Only settle these symbols; empty means every enabled symbol
    pub symbols: Vec<String>,
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            concurrency: env_u64("SETTLE_CONCURRENCY").map(|n| n as usize).unwrap_or(30),
            poll_interval: Duration::from_millis(env_u64("SETTLE_POLL_INTERVAL_MS").unwrap_or(50)),
            symbol_refresh_interval: Duration::from_secs(env_u64("SETTLE_SYMBOL_REFRESH_SECS").unwrap_or(5)),
            lock_retry_initial: Duration::from_millis(env_u64("SETTLE_LOCK_RETRY_INITIAL_MS").unwrap_or(10)),
            lock_retry_max: Duration::from_millis(env_u64("SETTLE_LOCK_RETRY_MAX_MS").unwrap_or(500)),
            dependency_timeout: Duration::from_secs(env_u64("SETTLE_DEPENDENCY_TIMEOUT_SECS").unwrap_or(30)),
            symbols: env::var("SETTLE_SYMBOLS")
                .map(|s| parse_symbols(&s))
                .unwrap_or_default(),
        }
    }
}

impl SettlementConfig {
    /// Create a new configuration using environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Whether `symbol` passes the allow-list
    pub fn allows(&self, symbol: &str) -> bool {
        self.symbols.is_empty() || self.symbols.iter().any(|s| s == symbol)
    }
}

/// Split a comma separated symbol list
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_is_optional() {
        let mut config = SettlementConfig::default();
        config.symbols.clear();
        assert!(config.allows("usdjpy"));

        config.symbols = parse_symbols(" usdjpy, BTCJPY ,,");
        assert_eq!(config.symbols, vec!["usdjpy", "btcjpy"]);
        assert!(config.allows("btcjpy"));
        assert!(!config.allows("ethjpy"));
    }
}
