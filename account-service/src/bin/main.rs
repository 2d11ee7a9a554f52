use account_service::{AccountService, AccountServiceConfig};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Asset ledger CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Database URL
    #[arg(short, long)]
    database_url: Option<String>,

    /// Commands
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Credit a user's available balance
    Deposit {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        asset: String,

        #[arg(long)]
        amount: Decimal,

        /// Business reference recorded in the asset log
        #[arg(short, long, default_value = "cli")]
        ref_id: String,
    },
    /// Print a user's balances
    Balance {
        #[arg(short, long)]
        user: String,

        /// Only this asset
        #[arg(short, long)]
        asset: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!("account_service={}", cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AccountServiceConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    let service = AccountService::with_config(&config).await?;

    match cli.command {
        Commands::Deposit { user, asset, amount, ref_id } => {
            let balance = service.deposit(&user, &asset, amount, &ref_id).await?;
            info!("Deposited {} {} to {}", amount, asset, user);
            println!("{} {}: available {} freeze {}", balance.user_id, balance.asset, balance.available, balance.freeze);
        }
        Commands::Balance { user, asset } => {
            let balances = match asset {
                Some(asset) => vec![service.get_balance(&user, &asset).await?],
                None => service.get_balances(&user).await?,
            };
            for balance in balances {
                println!("{} {}: available {} freeze {}", balance.user_id, balance.asset, balance.available, balance.freeze);
            }
        }
    }

    Ok(())
}
