#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use account_service::AccountService;
use common::db::{MemoryState, SharedMemoryState};
use common::decimal::dec;
use common::model::account::Balance;
use common::model::order::{Order, Side};
use common::model::trade::TradeResult;
use common::model::variety::TradingVariety;
use common::queue::InMemoryMessageQueue;
use common::registry::InMemoryVarietyRegistry;
use common::{MessageQueue, QueueKey};
use order_service::{InMemoryOrderRepository, OrderService};
use rust_decimal::Decimal;
use settlement::{Clearing, InMemoryOrderLock, LegOutcome, SettlementConfig, SettlementPipeline};

pub const SYMBOL: &str = "usdjpy";

static TRADE_CLOCK: AtomicI64 = AtomicI64::new(1_700_000_000_000_000_000);

pub fn fast_config() -> SettlementConfig {
    SettlementConfig {
        concurrency: 8,
        poll_interval: Duration::from_millis(5),
        symbol_refresh_interval: Duration::from_millis(50),
        lock_retry_initial: Duration::from_millis(20),
        lock_retry_max: Duration::from_millis(20),
        dependency_timeout: Duration::from_secs(3),
        symbols: Vec::new(),
    }
}

pub struct Harness {
    pub state: SharedMemoryState,
    pub ledger: Arc<AccountService>,
    pub orders: OrderService,
    pub registry: Arc<InMemoryVarietyRegistry>,
    pub queue: Arc<InMemoryMessageQueue>,
    pub lock: Arc<InMemoryOrderLock>,
    pub clearing: Arc<Clearing>,
    pub pipeline: Arc<SettlementPipeline>,
    pub config: SettlementConfig,
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: SettlementConfig) -> Harness {
    let state = MemoryState::shared();
    let ledger = Arc::new(AccountService::in_memory(state.clone()));
    let registry = Arc::new(InMemoryVarietyRegistry::new());
    registry.insert(TradingVariety::new(SYMBOL, "usd", "jpy", dec!(0.005)));

    let queue = Arc::new(InMemoryMessageQueue::new());
    let repo = Arc::new(InMemoryOrderRepository::new(state.clone()));
    let orders = OrderService::new(repo.clone(), ledger.clone(), registry.clone(), queue.clone());

    let clearing = Arc::new(Clearing::new(repo, ledger.clone(), registry.clone()));
    let lock = Arc::new(InMemoryOrderLock::new());
    let pipeline = Arc::new(SettlementPipeline::new(clearing.clone(), lock.clone(), queue.clone(), &config));

    Harness {
        state,
        ledger,
        orders,
        registry,
        queue,
        lock,
        clearing,
        pipeline,
        config,
    }
}

impl Harness {
    pub async fn fund(&self, user: &str, asset: &str, amount: Decimal) {
        self.ledger.deposit(user, asset, amount, "funding").await.unwrap();
    }

    pub async fn balance(&self, user: &str, asset: &str) -> Balance {
        self.ledger.get_balance(user, asset).await.unwrap()
    }

    pub async fn sell(&self, user: &str, price: Decimal, qty: Decimal) -> Order {
        self.orders.place_limit(user, SYMBOL, Side::Sell, price, qty).await.unwrap()
    }

    pub async fn buy(&self, user: &str, price: Decimal, qty: Decimal) -> Order {
        self.orders.place_limit(user, SYMBOL, Side::Buy, price, qty).await.unwrap()
    }

    pub async fn order(&self, order_id: &str) -> Order {
        self.orders.get_order(order_id).await.unwrap()
    }

    /// Register and settle one leg, as a worker would
    pub async fn settle(&self, result: TradeResult) -> LegOutcome {
        let raw = result.to_bytes().unwrap();
        let accepted = self.pipeline.accept(SYMBOL, &raw).await.unwrap();
        self.pipeline.settle_leg(accepted, raw).await
    }

    /// Register every leg in order, then settle them all concurrently
    pub async fn settle_concurrently(&self, results: Vec<TradeResult>) -> Vec<LegOutcome> {
        let mut accepted = Vec::new();
        for result in results {
            let raw = result.to_bytes().unwrap();
            accepted.push((self.pipeline.accept(SYMBOL, &raw).await.unwrap(), raw));
        }

        let handles: Vec<_> = accepted
            .into_iter()
            .map(|(result, raw)| {
                let pipeline = self.pipeline.clone();
                tokio::spawn(async move { pipeline.settle_leg(result, raw).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in futures::future::join_all(handles).await {
            outcomes.push(handle.unwrap());
        }
        outcomes
    }

    pub fn quotes(&self) -> Vec<TradeResult> {
        self.queue
            .snapshot(&QueueKey::QuoteTradeResult(SYMBOL.to_string()))
            .iter()
            .map(|raw| TradeResult::parse(raw, SYMBOL).unwrap())
            .collect()
    }

    pub fn stalled(&self) -> Vec<Vec<u8>> {
        self.queue.snapshot(&QueueKey::Stalled(SYMBOL.to_string()))
    }

    pub async fn push_result(&self, result: &TradeResult) {
        self.queue
            .push(&QueueKey::TradeResult(SYMBOL.to_string()), result.to_bytes().unwrap())
            .await
            .unwrap();
    }
}

/// A trade between two placed orders, stamped with a fresh trade time
pub fn trade(ask: &Order, bid: &Order, price: Decimal, qty: Decimal) -> TradeResult {
    TradeResult::new(
        SYMBOL,
        ask.order_id.clone(),
        bid.order_id.clone(),
        price,
        qty,
        TRADE_CLOCK.fetch_add(1, Ordering::SeqCst),
    )
}

pub fn settled(outcome: &LegOutcome) -> bool {
    matches!(outcome, LegOutcome::Settled(_))
}
