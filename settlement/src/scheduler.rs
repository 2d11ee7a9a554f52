//! Per-symbol queue workers and the settlement concurrency gate

use std::sync::Arc;
use std::time::Duration;

use common::error::{Error, Result};
use common::{MessageQueue, QueueKey, VarietyRegistry};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SettlementConfig;
use crate::pipeline::SettlementPipeline;

/// Owns the symbol workers and the in-flight settlement tasks
///
/// Each enabled symbol gets exactly one worker that drains its trade result
/// queue. Every accepted leg is settled on its own task, admitted through a
/// gate of `concurrency` permits.
pub struct SettlementScheduler {
    pipeline: Arc<SettlementPipeline>,
    registry: Arc<dyn VarietyRegistry>,
    queue: Arc<dyn MessageQueue>,
    config: SettlementConfig,
    permits: Arc<Semaphore>,
    workers: DashMap<String, JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl SettlementScheduler {
    pub fn new(
        pipeline: Arc<SettlementPipeline>,
        registry: Arc<dyn VarietyRegistry>,
        queue: Arc<dyn MessageQueue>,
        config: SettlementConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pipeline,
            registry,
            queue,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            workers: DashMap::new(),
            shutdown,
        }
    }

    pub fn pipeline(&self) -> &Arc<SettlementPipeline> {
        &self.pipeline
    }

    /// Symbols that currently have a worker
    pub fn running_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Settlement tasks currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.config.concurrency.max(1) - self.permits.available_permits()
    }

    /// Start the worker for `symbol` unless one is already running
    pub fn start_symbol(&self, symbol: &str) -> bool {
        if *self.shutdown.borrow() {
            warn!(symbol, "Scheduler is shutting down, not starting worker");
            return false;
        }

        match self.workers.entry(symbol.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let worker = SymbolWorker {
                    symbol: symbol.to_string(),
                    pipeline: self.pipeline.clone(),
                    queue: self.queue.clone(),
                    permits: self.permits.clone(),
                    poll_interval: self.config.poll_interval,
                };
                let handle = tokio::spawn(worker.run(self.shutdown.subscribe()));
                slot.insert(handle);
                true
            }
        }
    }

    /// Start workers for enabled symbols that do not have one yet
    pub async fn sync_symbols(&self) -> Result<usize> {
        let mut started = 0;
        for variety in self.registry.all_enabled().await? {
            if self.config.allows(&variety.symbol) && self.start_symbol(&variety.symbol) {
                started += 1;
            }
        }
        if started > 0 {
            info!(started, running = self.workers.len(), "Settlement workers synced");
        }
        Ok(started)
    }

    /// Keep the worker set in line with the registry until shutdown
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        info!(
            concurrency = self.config.concurrency,
            refresh_secs = self.config.symbol_refresh_interval.as_secs(),
            "Settlement scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sync_symbols().await {
                error!(error = %e, "Failed to refresh trading symbols");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.symbol_refresh_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Stop every worker and wait for in-flight settlements to finish
    pub async fn shutdown(&self) {
        info!("Stopping settlement scheduler");
        self.shutdown.send_replace(true);

        for symbol in self.running_symbols() {
            if let Some((_, handle)) = self.workers.remove(&symbol) {
                if let Err(e) = handle.await {
                    error!(symbol = %symbol, error = %e, "Settlement worker ended abnormally");
                }
            }
        }

        let capacity = self.config.concurrency.max(1) as u32;
        match self.permits.acquire_many(capacity).await {
            Ok(_drained) => info!("Settlement scheduler stopped, no settlement in flight"),
            Err(e) => error!(error = %e, "Settlement gate closed while draining"),
        }
    }
}

/// Drains the trade result queue of one symbol
struct SymbolWorker {
    symbol: String,
    pipeline: Arc<SettlementPipeline>,
    queue: Arc<dyn MessageQueue>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
}

impl SymbolWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(symbol = %self.symbol, "Settlement worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(popped) => !popped,
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "Settlement worker poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(symbol = %self.symbol, "Settlement worker stopped");
    }

    /// Pop at most one trade result and hand it to a settlement task
    async fn poll_once(&self) -> Result<bool> {
        let key = QueueKey::TradeResult(self.symbol.clone());
        if self.queue.len(&key).await? == 0 {
            return Ok(false);
        }
        let Some(raw) = self.queue.pop(&key).await? else {
            return Ok(false);
        };
        debug!(symbol = %self.symbol, payload = %String::from_utf8_lossy(&raw), "Popped trade result");

        let result = match self.pipeline.accept(&self.symbol, &raw).await {
            Ok(result) => result,
            Err(Error::MalformedEvent(reason)) => {
                error!(
                    symbol = %self.symbol,
                    reason = %reason,
                    payload = %String::from_utf8_lossy(&raw),
                    "Dropping malformed trade result"
                );
                return Ok(true);
            }
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "Failed to register trade result, parking it");
                self.queue.push(&QueueKey::Stalled(self.symbol.clone()), raw).await?;
                return Ok(true);
            }
        };

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("settlement gate closed: {}", e)))?;

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            pipeline.settle_leg(result, raw).await;
            drop(permit);
        });

        Ok(true)
    }
}
