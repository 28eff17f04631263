use chrono::Local;
use clap::Parser;
use log::{error, info};
use marketcall::calls::{CallState, EscrowState};
use marketcall::types::events::{CallStateChanged, EscrowStateChanged};
use marketcall::{CallHandle, CallManager, Party, SignalRelay, SignalerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// Runs a buyer and a seller against the in-process relay.
//
// Usage:
//   cargo run                        # call, accept, propose escrow, decline it
//   cargo run -- --reject            # the seller declines the call
//   cargo run -- --amount 7500       # escrow amount

#[derive(Parser)]
#[command(name = "marketcall")]
#[command(about = "Call and escrow signaling demo")]
struct Cli {
    /// The seller declines the call instead of answering.
    #[arg(short, long)]
    reject: bool,

    /// Escrow amount proposed during the call.
    #[arg(short, long, default_value_t = 5000.0)]
    amount: f64,

    /// The seller accepts the escrow proposal.
    #[arg(long)]
    pay: bool,

    /// Room id for the call.
    #[arg(long, default_value = "room-1")]
    room: String,
}

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let buyer = Party::new("buyer", "Ada (buyer)");
    let seller = Party::new("seller", "Sam (seller)");

    let relay = SignalRelay::default();
    relay.register("buyer-token", buyer.clone());
    relay.register("seller-token", seller.clone());

    let config = SignalerConfig::default();
    let a = CallManager::spawn(buyer.clone(), Arc::new(relay.channel()), config.clone());
    let b = CallManager::spawn(seller.clone(), Arc::new(relay.channel()), config);
    log_events(&a);
    log_events(&b);

    a.connect("buyer-token").await?;
    b.connect("seller-token").await?;

    let mut a_calls = a.events().call_state.subscribe();
    let mut b_calls = b.events().call_state.subscribe();

    let room = a.initiate_in(cli.room.as_str(), seller, None).await?;
    wait_for_call(&mut b_calls, CallState::Incoming).await?;

    if cli.reject {
        b.reject(room.clone()).await?;
        wait_for_call(&mut a_calls, CallState::Idle).await?;
        match a.request_escrow(cli.amount, "Shoes", "Size 42").await {
            Err(e) => info!("Escrow after a declined call is refused: {}", e),
            Ok(reference) => error!("Escrow {} should not exist", reference),
        }
        return Ok(());
    }

    b.accept(room.clone()).await?;
    wait_for_call(&mut a_calls, CallState::Active).await?;

    let mut a_escrow = a.events().escrow_state.subscribe();
    let mut b_escrow = b.events().escrow_state.subscribe();

    let reference = a.request_escrow(cli.amount, "Shoes", "Size 42").await?;
    info!("Escrow {} proposed", reference);
    wait_for_escrow(&mut b_escrow, EscrowState::Requested).await?;

    b.respond_escrow(cli.pay).await?;
    let settled = if cli.pay {
        EscrowState::Accepted
    } else {
        EscrowState::Rejected
    };
    wait_for_escrow(&mut a_escrow, settled).await?;

    a.acknowledge_escrow().await?;
    b.acknowledge_escrow().await?;

    a.end(room).await?;
    wait_for_call(&mut b_calls, CallState::Idle).await?;

    info!("Buyer: {}", serde_json::to_string(&a.snapshot().await?)?);
    info!("Seller: {}", serde_json::to_string(&b.snapshot().await?)?);
    Ok(())
}

fn log_events(handle: &CallHandle) {
    let who = handle.local().id.clone();
    let mut ui = handle.events().ui.subscribe();
    tokio::spawn(async move {
        while let Ok(cue) = ui.recv().await {
            match serde_json::to_string(cue.as_ref()) {
                Ok(json) => info!("[{}] {}", who, json),
                Err(e) => error!("[{}] unprintable cue: {}", who, e),
            }
        }
    });
}

async fn wait_for_call(
    rx: &mut broadcast::Receiver<Arc<CallStateChanged>>,
    state: CallState,
) -> Result<(), anyhow::Error> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let change = rx.recv().await?;
            if change.current == state {
                return Ok::<_, anyhow::Error>(());
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for call state {:?}", state))?
}

async fn wait_for_escrow(
    rx: &mut broadcast::Receiver<Arc<EscrowStateChanged>>,
    state: EscrowState,
) -> Result<(), anyhow::Error> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let change = rx.recv().await?;
            if change.current == state {
                return Ok::<_, anyhow::Error>(());
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for escrow state {:?}", state))?
}
