//! Bounded waiting with exponential backoff

use std::future::Future;
use std::time::Duration;

use common::error::{Error, Result};
use tokio::time::Instant;
use tracing::debug;

use crate::config::SettlementConfig;

/// Retry schedule for lock and dependency waits
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl Backoff {
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            initial: config.lock_retry_initial,
            max: config.lock_retry_max,
            timeout: config.dependency_timeout,
        }
    }

    /// Poll `check` until it reports true
    ///
    /// Fails with `DependencyStall` once `timeout` has passed; errors from
    /// `check` are returned as they are.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut delay = self.initial;
        let mut attempts: u32 = 0;

        loop {
            if check().await? {
                return Ok(());
            }
            attempts += 1;

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DependencyStall(format!(
                    "{} still busy after {:?} ({} attempts)",
                    what, self.timeout, attempts
                )));
            }

            debug!(what, attempts, delay_ms = delay.as_millis() as u64, "Waiting");
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.max);
        }
    }
}
