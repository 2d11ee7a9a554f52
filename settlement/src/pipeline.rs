//! Settlement of single trade legs under the order lock

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::error::{Error, Result};
use common::model::order::Order;
use common::model::trade::{TradeLog, TradeResult};
use common::{MessageQueue, QueueKey};
use futures::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clearing::Clearing;
use crate::config::SettlementConfig;
use crate::lock::OrderLock;
use crate::wait::Backoff;

/// How a leg left the pipeline
#[derive(Debug)]
pub enum LegOutcome {
    /// Applied and forwarded to the quote queue
    Settled(TradeLog),
    /// Already applied earlier; nothing changed
    Duplicate,
    /// Dependency or hold not released in time; parked on the stalled queue
    Stalled,
    /// Rolled back; needs manual reconciliation
    Failed(Error),
}

pub struct SettlementPipeline {
    clearing: Arc<Clearing>,
    lock: Arc<dyn OrderLock>,
    queue: Arc<dyn MessageQueue>,
    backoff: Backoff,
}

impl SettlementPipeline {
    pub fn new(
        clearing: Arc<Clearing>,
        lock: Arc<dyn OrderLock>,
        queue: Arc<dyn MessageQueue>,
        config: &SettlementConfig,
    ) -> Self {
        Self {
            clearing,
            lock,
            queue,
            backoff: Backoff::from_config(config),
        }
    }

    pub fn lock(&self) -> &Arc<dyn OrderLock> {
        &self.lock
    }

    /// Parse a popped payload and register the leg on both of its orders
    ///
    /// Registration happens in pop order, before the leg is handed to a task,
    /// so a later `last` leg always sees every earlier sibling.
    pub async fn accept(&self, symbol: &str, raw: &[u8]) -> Result<TradeResult> {
        let result = TradeResult::parse(raw, symbol)?;
        self.lock.lock(&result.order_ids()).await?;
        debug!(symbol, ask = %result.ask_order_id, bid = %result.bid_order_id, "Leg registered");
        Ok(result)
    }

    /// Settle an accepted leg; its registrations are dropped on every path
    pub async fn settle_leg(&self, result: TradeResult, raw: Vec<u8>) -> LegOutcome {
        let outcome = AssertUnwindSafe(self.run_leg(&result))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Internal("settlement task panicked".to_string())));

        if let Err(e) = self.lock.unlock(&result.order_ids()).await {
            error!(
                symbol = %result.symbol,
                ask = %result.ask_order_id,
                bid = %result.bid_order_id,
                error = %e,
                "Failed to drop leg registration"
            );
        }

        match outcome {
            Ok(log) => {
                if let Err(e) = self.queue.push(&QueueKey::QuoteTradeResult(result.symbol.clone()), raw).await {
                    error!(symbol = %result.symbol, trade_id = %log.trade_id, error = %e, "Failed to forward trade to quote queue");
                }
                LegOutcome::Settled(log)
            }
            Err(Error::AlreadySettled(trade_id)) => {
                warn!(symbol = %result.symbol, trade_id = %trade_id, "Trade result replayed, skipping");
                LegOutcome::Duplicate
            }
            Err(Error::DependencyStall(reason)) => {
                error!(
                    symbol = %result.symbol,
                    ask = %result.ask_order_id,
                    bid = %result.bid_order_id,
                    reason = %reason,
                    "Settlement stalled, parking trade result"
                );
                if let Err(e) = self.queue.push(&QueueKey::Stalled(result.symbol.clone()), raw).await {
                    error!(symbol = %result.symbol, error = %e, "Failed to park stalled trade result");
                }
                LegOutcome::Stalled
            }
            Err(e) => {
                error!(
                    symbol = %result.symbol,
                    ask = %result.ask_order_id,
                    bid = %result.bid_order_id,
                    error = %e,
                    "Settlement failed"
                );
                LegOutcome::Failed(e)
            }
        }
    }

    async fn run_leg(&self, result: &TradeResult) -> Result<TradeLog> {
        let ids = result.order_ids();
        let lock = self.lock.as_ref();

        if let Some(last) = result.last.as_deref() {
            let own = u64::from(ids.contains(&last));
            // give legs popped right after this one time to register
            tokio::time::sleep(self.backoff.initial).await;
            self.backoff
                .wait_until(&format!("legs of {}", last), move || async move {
                    Ok::<_, Error>(lock.get_lock(last).await? <= own)
                })
                .await?;
        }

        let owner = Uuid::new_v4().to_string();
        let (held, holder) = (&ids[..], owner.as_str());
        self.backoff
            .wait_until("order hold", move || async move { lock.try_acquire(held, holder).await })
            .await?;

        let outcome = AssertUnwindSafe(self.clearing.settle(result)).catch_unwind().await;

        if let Err(e) = lock.release(&ids, &owner).await {
            error!(owner = %owner, error = %e, "Failed to release order hold");
        }

        outcome.unwrap_or_else(|_| Err(Error::Internal("trade application panicked".to_string())))
    }

    /// Cancel an order once no leg references it any more
    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<Order> {
        let lock = self.lock.as_ref();
        self.backoff
            .wait_until(&format!("legs of {}", order_id), move || async move {
                Ok::<_, Error>(lock.get_lock(order_id).await? == 0)
            })
            .await?;

        let ids = [order_id];
        let owner = Uuid::new_v4().to_string();
        let (held, holder) = (&ids[..], owner.as_str());
        self.backoff
            .wait_until("order hold", move || async move { lock.try_acquire(held, holder).await })
            .await?;

        let outcome = AssertUnwindSafe(self.clearing.cancel(symbol, order_id)).catch_unwind().await;

        if let Err(e) = lock.release(&ids, &owner).await {
            error!(owner = %owner, error = %e, "Failed to release order hold");
        }

        let order = outcome.unwrap_or_else(|_| Err(Error::Internal("cancellation panicked".to_string())))?;
        info!(symbol, order_id, "Cancellation settled");
        Ok(order)
    }
}
