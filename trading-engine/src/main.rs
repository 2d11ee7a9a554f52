//! Settlement process: drains trade results and keeps the order outbox flowing

mod config;

use std::sync::Arc;

use account_service::{AccountService, RepositoryType};
use clap::Parser;
use common::db::{init_db_pool, run_migrations, MemoryState};
use common::decimal::dec;
use common::model::variety::TradingVariety;
use common::queue::{InMemoryMessageQueue, PostgresMessageQueue};
use common::registry::{InMemoryVarietyRegistry, PostgresVarietyRegistry};
use common::{MessageQueue, VarietyRegistry};
use dotenv::dotenv;
use order_service::{InMemoryOrderRepository, OrderRepository, OrderService, PostgresOrderRepository};
use settlement::config::parse_symbols;
use settlement::{Clearing, InMemoryOrderLock, OrderLock, PostgresOrderLock, SettlementPipeline, SettlementScheduler};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Backend, EngineConfig};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Storage backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Database URL
    #[arg(long)]
    database_url: Option<String>,

    /// Default log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Only settle these symbols (comma separated)
    #[arg(long)]
    symbols: Option<String>,

    /// Settlement tasks allowed in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Run database migrations before starting
    #[arg(long)]
    migrate: bool,

    /// Register a usdjpy pair (memory backend only)
    #[arg(long)]
    demo: bool,
}

struct Services {
    orders: Arc<OrderService>,
    scheduler: Arc<SettlementScheduler>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let mut config = EngineConfig::from_env();
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(url) = args.database_url {
        config.account.database_url = url;
    }
    if let Some(symbols) = args.symbols.as_deref() {
        config.settlement.symbols = parse_symbols(symbols);
    }
    if let Some(concurrency) = args.concurrency {
        config.settlement.concurrency = concurrency;
    }
    config.run_migrations |= args.migrate;

    info!(backend = ?config.backend, concurrency = config.settlement.concurrency, "Starting settlement engine...");

    let services = build_services(&config, args.demo).await?;
    let (stop, stopped) = watch::channel(false);

    let scheduler_handle = {
        let scheduler = services.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };
    let outbox_handle = tokio::spawn(run_outbox_recovery(services.orders.clone(), config.clone(), stopped));

    shutdown_signal().await;

    stop.send_replace(true);
    services.scheduler.shutdown().await;
    for (name, handle) in [("scheduler", scheduler_handle), ("outbox recovery", outbox_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!("Settlement engine stopped");
    Ok(())
}

fn init_tracing(cli_level: Option<&str>) {
    // DEBUG=1 in .env switches the default to debug
    let env_debug = std::env::var("DEBUG").unwrap_or_else(|_| "0".to_string());
    let level = cli_level
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(if env_debug == "1" { Level::DEBUG } else { Level::INFO });

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();

    // Only set the global subscriber if it hasn't been set already
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        debug!(%level, "Tracing initialized");
    }
}

async fn build_services(config: &EngineConfig, demo: bool) -> common::Result<Services> {
    let ledger: Arc<AccountService>;
    let repo: Arc<dyn OrderRepository>;
    let registry: Arc<dyn VarietyRegistry>;
    let queue: Arc<dyn MessageQueue>;
    let lock: Arc<dyn OrderLock>;

    match config.backend {
        Backend::Postgres => {
            let pool = init_db_pool(&config.account.database_url, config.account.db_pool_size).await?;
            if config.run_migrations {
                run_migrations(&pool).await?;
                info!("Database migrations applied");
            }
            if demo {
                warn!("--demo only applies to the memory backend, ignoring");
            }

            ledger = Arc::new(AccountService::with_repository(RepositoryType::Postgres(pool.clone()), &config.account));
            repo = Arc::new(PostgresOrderRepository::new(pool.clone()));
            registry = Arc::new(PostgresVarietyRegistry::new(pool.clone()));
            queue = Arc::new(PostgresMessageQueue::new(pool.clone()));
            lock = Arc::new(PostgresOrderLock::new(pool));
        }
        Backend::Memory => {
            warn!("Memory backend keeps everything in process and slows as tables grow; use it for tests and demos only");
            let state = MemoryState::shared();
            let varieties = InMemoryVarietyRegistry::new();
            if demo {
                info!("Registering demo pair usdjpy");
                varieties.insert(TradingVariety::new("usdjpy", "usd", "jpy", dec!(0.005)));
            }

            ledger = Arc::new(AccountService::with_repository(RepositoryType::InMemory(state.clone()), &config.account));
            repo = Arc::new(InMemoryOrderRepository::new(state));
            registry = Arc::new(varieties);
            queue = Arc::new(InMemoryMessageQueue::new());
            lock = Arc::new(InMemoryOrderLock::new());
        }
    }

    let orders = Arc::new(OrderService::new(repo.clone(), ledger.clone(), registry.clone(), queue.clone()));
    let clearing = Arc::new(Clearing::new(repo, ledger, registry.clone()));
    let pipeline = Arc::new(SettlementPipeline::new(clearing, lock, queue.clone(), &config.settlement));
    let scheduler = Arc::new(SettlementScheduler::new(pipeline, registry, queue, config.settlement.clone()));

    Ok(Services { orders, scheduler })
}

/// Republish committed orders whose dispatch to the matcher never happened
async fn run_outbox_recovery(orders: Arc<OrderService>, config: EngineConfig, mut stopped: watch::Receiver<bool>) {
    info!(
        interval_secs = config.outbox_interval.as_secs(),
        min_age_secs = config.outbox_min_age.as_secs(),
        "Starting outbox recovery"
    );

    loop {
        match orders.redispatch_pending(config.outbox_min_age(), config.outbox_batch).await {
            Ok(0) => {}
            Ok(sent) => info!(sent, "Outbox redispatched"),
            Err(e) => error!(error = %e, "Outbox recovery failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(config.outbox_interval) => {}
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    break;
                }
            }
        }
    }

    info!("Outbox recovery stopped");
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
