// PostgreSQL end-to-end settlement tests
// These tests require a running PostgreSQL database
// Run with: cargo test --test postgres_flow_tests -- --ignored

use std::sync::Arc;
use std::time::Duration;

use account_service::{AccountService, AccountServiceConfig, RepositoryType};
use common::db::{init_db_pool, run_migrations};
use common::decimal::dec;
use common::model::order::{Side, Status};
use common::model::trade::TradeResult;
use common::model::variety::TradingVariety;
use common::queue::PostgresMessageQueue;
use common::registry::InMemoryVarietyRegistry;
use common::{MessageQueue, QueueKey};
use dotenv::dotenv;
use order_service::{OrderService, PostgresOrderRepository};
use settlement::{Clearing, LegOutcome, PostgresOrderLock, SettlementConfig, SettlementPipeline};

struct PgExchange {
    ledger: Arc<AccountService>,
    orders: OrderService,
    queue: Arc<PostgresMessageQueue>,
    pipeline: SettlementPipeline,
    symbol: String,
}

async fn create_test_exchange() -> PgExchange {
    dotenv().ok();

    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run PostgreSQL tests");
    let pool = init_db_pool(&database_url, 5).await.expect("Failed to connect to test database");
    run_migrations(&pool).await.expect("Failed to run migrations");

    // a fresh symbol per run keeps queues and open orders apart
    let symbol = format!("t{}jpy", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let registry = Arc::new(InMemoryVarietyRegistry::new());
    registry.insert(TradingVariety::new(symbol.clone(), "usd", "jpy", dec!(0.005)));

    let ledger = Arc::new(AccountService::with_repository(
        RepositoryType::Postgres(pool.clone()),
        &AccountServiceConfig::default(),
    ));
    let repo = Arc::new(PostgresOrderRepository::new(pool.clone()));
    let queue = Arc::new(PostgresMessageQueue::new(pool.clone()));
    let orders = OrderService::new(repo.clone(), ledger.clone(), registry.clone(), queue.clone());

    let config = SettlementConfig {
        lock_retry_initial: Duration::from_millis(20),
        lock_retry_max: Duration::from_millis(50),
        dependency_timeout: Duration::from_secs(5),
        ..SettlementConfig::default()
    };
    let clearing = Arc::new(Clearing::new(repo, ledger.clone(), registry));
    let pipeline = SettlementPipeline::new(clearing, Arc::new(PostgresOrderLock::new(pool)), queue.clone(), &config);

    PgExchange { ledger, orders, queue, pipeline, symbol }
}

fn unique_user(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
#[ignore = "Requires test database"]
async fn test_postgres_full_match() {
    let ex = create_test_exchange().await;
    let seller = unique_user("seller");
    let buyer = unique_user("buyer");
    ex.ledger.deposit(&seller, "usd", dec!(10000), "d1").await.unwrap();
    ex.ledger.deposit(&buyer, "jpy", dec!(10000), "d1").await.unwrap();

    let ask = ex.orders.place_limit(&seller, &ex.symbol, Side::Sell, dec!(1), dec!(1)).await.unwrap();
    let bid = ex.orders.place_limit(&buyer, &ex.symbol, Side::Buy, dec!(1), dec!(1)).await.unwrap();
    assert_eq!(ex.queue.len(&QueueKey::NewOrder(ex.symbol.clone())).await.unwrap(), 2);

    let leg = TradeResult::new(ex.symbol.clone(), ask.order_id.clone(), bid.order_id.clone(), dec!(1), dec!(1), 1);
    let raw = leg.to_bytes().unwrap();
    let accepted = ex.pipeline.accept(&ex.symbol, &raw).await.unwrap();
    assert!(matches!(ex.pipeline.settle_leg(accepted, raw.clone()).await, LegOutcome::Settled(_)));

    assert_eq!(ex.ledger.get_balance(&seller, "jpy").await.unwrap().available, dec!(0.995));
    let buyer_jpy = ex.ledger.get_balance(&buyer, "jpy").await.unwrap();
    assert_eq!(buyer_jpy.available, dec!(9998.995));
    assert_eq!(buyer_jpy.freeze, dec!(0));
    assert_eq!(ex.orders.get_order(&bid.order_id).await.unwrap().status, Status::Filled);

    // replay
    let accepted = ex.pipeline.accept(&ex.symbol, &raw).await.unwrap();
    assert!(matches!(ex.pipeline.settle_leg(accepted, raw).await, LegOutcome::Duplicate));
    assert_eq!(ex.ledger.get_balance(&buyer, "usd").await.unwrap().available, dec!(1));
    assert_eq!(ex.queue.len(&QueueKey::QuoteTradeResult(ex.symbol.clone())).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "Requires test database"]
async fn test_postgres_cancel_releases_freeze() {
    let ex = create_test_exchange().await;
    let buyer = unique_user("buyer");
    ex.ledger.deposit(&buyer, "jpy", dec!(100), "d1").await.unwrap();

    let bid = ex.orders.place_limit(&buyer, &ex.symbol, Side::Buy, dec!(2), dec!(10)).await.unwrap();
    assert_eq!(ex.ledger.get_balance(&buyer, "jpy").await.unwrap().freeze, dec!(20.1));

    let cancelled = ex.pipeline.cancel(&ex.symbol, &bid.order_id).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);

    let jpy = ex.ledger.get_balance(&buyer, "jpy").await.unwrap();
    assert_eq!(jpy.freeze, dec!(0));
    assert_eq!(jpy.available, dec!(100));
    assert!(ex.orders.open_orders(&ex.symbol).await.unwrap().is_empty());
}
