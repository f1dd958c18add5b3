use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use chrono::Utc;
use peerlend_backend::envelope::{EnvelopeBuilder, GasSettings};
use peerlend_backend::service::LoanService;
use peerlend_backend::state::LoanStore;
use peerlend_backend::{rest, rpc_gateway};
use peerlend_chain::scenarios::{ALICE_KEY, BOB_KEY};
use peerlend_chain::{ChainAccess, DemoScenario, EthRpcClient};
use peerlend_client::{
    ConfirmationPolicy, HttpTransport, LoanCoordinator, LoanServer, LocalKeyWallet, Session,
    TransportConfig,
};
use peerlend_types::wire::{NewLoanRequest, UserProfile};
use peerlend_types::{LoanAction, UserId};
use tracing::info;

type Coordinator = LoanCoordinator<HttpTransport, LocalKeyWallet<EthRpcClient>, HttpTransport>;

fn coordinator(
    server: &Arc<HttpTransport>,
    rpc_url: &str,
    key: [u8; 32],
) -> Result<Coordinator, Box<dyn std::error::Error>> {
    let chain = EthRpcClient::new(rpc_url, Duration::from_secs(2))?;
    let wallet = Arc::new(LocalKeyWallet::new(chain, [key])?);
    Ok(LoanCoordinator::new(
        Arc::clone(server),
        wallet,
        Arc::clone(server),
        ConfirmationPolicy::WaitForReceipt {
            poll_interval_ms: 50,
            max_polls: 20,
        },
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    // Backend with the in-memory chain, wallets reach the chain over JSON-RPC.
    let scenario = DemoScenario::new(1337)?;
    let store = Arc::new(LoanStore::new());
    let chain: Arc<dyn ChainAccess> = Arc::new(scenario.chain.clone());
    let service = LoanService::new(
        Arc::clone(&store),
        Arc::clone(&chain),
        EnvelopeBuilder::new(scenario.contract, GasSettings::default()),
    );
    let router = rest::router(Arc::new(rest::AppState { service: service.clone() }))
        .merge(rpc_gateway::router(chain));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(error = %err, "backend stopped");
        }
    });
    let base_url = format!("http://{addr}");
    let rpc_url = format!("{base_url}/rpc");
    info!(%base_url, "backend listening");

    let alice_id = UserId::new("alice")?;
    let bob_id = UserId::new("bob")?;
    for (id, name) in [(&alice_id, "Alice"), (&bob_id, "Bob")] {
        service.register_user(UserProfile {
            user_id: id.clone(),
            display_name: name.to_string(),
        })?;
    }
    service.add_friend(&alice_id, &bob_id)?;

    let server = Arc::new(HttpTransport::new(TransportConfig {
        base_url: base_url.clone(),
        ..TransportConfig::default()
    })?);
    let alice = coordinator(&server, &rpc_url, ALICE_KEY)?;
    let bob = coordinator(&server, &rpc_url, BOB_KEY)?;

    let alice_binding = server
        .bind_wallet_address(&alice_id, scenario.accounts.alice)
        .await?;
    let alice_session = Session::new(alice_id.clone(), Some(alice_binding));

    info!("Alice asks Bob for 1 ether against her bike");
    let loan = alice
        .request_loan(
            &alice_session,
            &NewLoanRequest {
                lender_id: bob_id.clone(),
                amount: U256::from(10u64).pow(U256::from(18u64)),
                collateral: "bike".to_string(),
                due_date: Utc::now() + chrono::Duration::days(30),
            },
        )
        .await?;
    info!(loan_id = %loan.id, "loan requested");

    info!("Bob approves; his first transition binds his wallet");
    let approved = bob
        .transition(&Session::new(bob_id.clone(), None), &loan, LoanAction::Approve)
        .await?;
    info!(state = %approved.loan.state, tx_hash = %approved.tx.hash, "approved");
    let bob_session = Session::new(bob_id.clone(), approved.binding.clone());

    let new_due_date = approved.loan.due_date + chrono::Duration::days(7);
    info!("Alice asks for one more week");
    let requested = alice
        .transition(
            &alice_session,
            &approved.loan,
            LoanAction::RequestRenegotiation { new_due_date },
        )
        .await?;
    info!(state = %requested.loan.state, "renegotiation requested");

    let renegotiated = bob
        .transition(&bob_session, &requested.loan, LoanAction::ApproveRenegotiation)
        .await?;
    info!(due_date = %renegotiated.loan.due_date, "renegotiation approved");

    let repaid = alice
        .transition(&alice_session, &renegotiated.loan, LoanAction::Repay)
        .await?;
    info!(state = %repaid.loan.state, tx_hash = %repaid.tx.hash, "loan repaid");

    // Notices are sent in the background; give them a moment to land.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for user in [&alice_id, &bob_id] {
        for notice in service.notifications(user) {
            info!(user = %user, title = %notice.title, body = %notice.body, "inbox");
        }
    }

    let balances = scenario
        .chain
        .with_chain(|c| (c.balance(scenario.accounts.alice), c.balance(scenario.accounts.bob)))?;
    info!(alice = %balances.0, bob = %balances.1, "final balances");
    Ok(())
}
