use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use peerlend_backend::envelope::{EnvelopeBuilder, GasSettings};
use peerlend_backend::reminders::{spawn_reminder_loop, ReminderConfig};
use peerlend_backend::service::LoanService;
use peerlend_backend::state::LoanStore;
use peerlend_backend::{rest, rpc_gateway};
use peerlend_chain::{ChainAccess, DemoScenario, EthRpcClient};
use peerlend_types::Address;
use tracing::info;

const MAX_REMINDER_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_REMINDER_WINDOW_HOURS: i64 = 365 * 24;

#[derive(Parser, Debug)]
#[command(name = "peerlend-backend", about = "Peer-to-peer loan record server")]
struct Cli {
    /// HTTP/REST listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Ethereum JSON-RPC endpoint used to verify settlements.
    #[arg(long, conflicts_with = "mock_chain")]
    rpc_url: Option<String>,

    /// Run against an in-memory chain with the funded demo accounts, served to
    /// wallets as JSON-RPC at `/rpc`.
    #[arg(long)]
    mock_chain: bool,

    /// Chain ID; with `--rpc-url`, startup fails if the node reports another.
    #[arg(long, default_value = "1337")]
    chain_id: u64,

    /// Settlement contract address.
    #[arg(long, default_value = "0xc0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0")]
    contract: Address,

    /// RPC request timeout in milliseconds.
    #[arg(long, default_value = "5000")]
    rpc_timeout_ms: u64,

    #[arg(long, default_value = "300000")]
    gas_limit: u64,

    #[arg(long, default_value = "2000000000")]
    max_fee_per_gas: u128,

    #[arg(long, default_value = "1000000000")]
    max_priority_fee_per_gas: u128,

    /// Seconds between due-date reminder passes (at most one week).
    #[arg(
        long,
        default_value = "3600",
        value_parser = clap::value_parser!(u64).range(1..=MAX_REMINDER_INTERVAL_SECS)
    )]
    reminder_interval_secs: u64,

    /// Hours before a due date at which the borrower is reminded (at most one year).
    #[arg(
        long,
        default_value = "48",
        value_parser = clap::value_parser!(i64).range(0..=MAX_REMINDER_WINDOW_HOURS)
    )]
    reminder_window_hours: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let (chain, rpc_router): (Arc<dyn ChainAccess>, Option<axum::Router>) =
        match (&cli.rpc_url, cli.mock_chain) {
            (Some(rpc_url), _) => {
                let client =
                    EthRpcClient::new(rpc_url, Duration::from_millis(cli.rpc_timeout_ms))?;
                let reported = client.chain_id().await?;
                if reported != cli.chain_id {
                    return Err(format!(
                        "node at {rpc_url} reports chain id {reported}, expected {}",
                        cli.chain_id
                    )
                    .into());
                }
                let chain: Arc<dyn ChainAccess> = Arc::new(client);
                (chain, None)
            }
            (None, true) => {
                let scenario = DemoScenario::new(cli.chain_id)?;
                info!(
                    alice = %scenario.accounts.alice,
                    bob = %scenario.accounts.bob,
                    carol = %scenario.accounts.carol,
                    "in-memory chain with funded demo accounts"
                );
                let chain: Arc<dyn ChainAccess> = Arc::new(scenario.chain);
                (Arc::clone(&chain), Some(rpc_gateway::router(chain)))
            }
            (None, false) => return Err("either --rpc-url or --mock-chain is required".into()),
        };

    let gas = GasSettings {
        gas_limit: cli.gas_limit,
        max_fee_per_gas: cli.max_fee_per_gas,
        max_priority_fee_per_gas: cli.max_priority_fee_per_gas,
    };
    let store = Arc::new(LoanStore::new());
    let service = LoanService::new(
        Arc::clone(&store),
        chain,
        EnvelopeBuilder::new(cli.contract, gas),
    );

    let reminders = spawn_reminder_loop(
        store,
        ReminderConfig {
            interval: Duration::from_secs(cli.reminder_interval_secs),
            window: chrono::Duration::hours(cli.reminder_window_hours),
        },
    );

    let mut router = rest::router(Arc::new(rest::AppState { service }));
    if let Some(rpc_router) = rpc_router {
        router = router.merge(rpc_router);
    }

    info!(
        http = %cli.listen,
        rpc = cli.rpc_url.as_deref().unwrap_or("in-memory"),
        chain_id = cli.chain_id,
        contract = %cli.contract,
        "starting loan backend"
    );

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(addr = %cli.listen, "HTTP/REST server listening");
    let served = axum::serve(listener, router).await;
    reminders.abort();
    served?;
    Ok(())
}
