//! Interactive CLI demo of a full step-locked trade.
//!
//! Stands up an in-process marketplace — relay server, a minimal
//! matching broker, one buyer and one seller — and walks a 1 BTC trade
//! through admission, funds blocking, matching, the four-step exchange
//! and settlement. The output uses ANSI escape codes for colored,
//! storytelling-style terminal rendering.
//!
//! Run with:
//!   cargo run --example demo --release

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use stepswap_protocol::broker::{BrokerMessage, OrderBookEntry, OrderMatch};
use stepswap_protocol::config::ExchangeSettings;
use stepswap_protocol::crypto::TradeKeypair;
use stepswap_protocol::ids::{ExchangeId, OrderId, OverlayId, BROKER_ID};
use stepswap_protocol::money::{fiat_value, BitcoinAmount, Currency, FiatAmount};
use stepswap_protocol::order::{OrderEvent, OrderStatus, Side};
use stepswap_protocol::payment::{InMemoryPaymentHub, InMemoryPaymentProcessor, PaymentProcessor};
use stepswap_protocol::peer::{TradingPeer, TradingPeerConfig, TradingPeerHandle};
use stepswap_protocol::relay::{RelayClient, RelayClientConfig, RelayEvent, RelayServer};
use stepswap_protocol::wallet::{InMemoryWallet, Wallet};

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

const BG_BLUE: &str = "\x1b[44m";

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn banner() {
    println!();
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    STEPSWAP  --  Step-Locked Trade Demo                            {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    1 BTC for 100 EUR, four micro-payments, nobody trusted          {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!();
}

fn section(num: u32, title: &str) {
    println!();
    println!(
        "{BOLD}{CYAN}===[{YELLOW} Step {num} {CYAN}]=============================================================={RESET}"
    );
    println!("{BOLD}{WHITE}  {title}{RESET}");
    println!(
        "{CYAN}------------------------------------------------------------------------{RESET}"
    );
}

fn subsection(text: &str) {
    println!("{DIM}{CYAN}  >> {text}{RESET}");
}

fn success(text: &str) {
    println!("{GREEN}  [OK] {text}{RESET}");
}

fn info(label: &str, value: &str) {
    println!("{WHITE}  {BOLD}{label}:{RESET} {YELLOW}{value}{RESET}");
}

fn timing(label: &str, elapsed: Duration) {
    let ms = elapsed.as_secs_f64() * 1000.0;
    println!("{DIM}{MAGENTA}  [{label}: {ms:.2} ms]{RESET}");
}

fn progress_bar(name: &str, progress: f64, color: &str) {
    let filled = (progress * 24.0).round() as usize;
    let bar: String = "#".repeat(filled) + &"-".repeat(24 - filled.min(24));
    println!(
        "  {color}{BOLD}{name:<8}{RESET} {WHITE}[{bar}]{RESET} {YELLOW}{:>5.1}%{RESET}",
        progress * 100.0
    );
}

// ---------------------------------------------------------------------------
// A minimal matching broker
// ---------------------------------------------------------------------------

/// Joins the relay as the broker and matches the first crossing
/// bid/ask pair for the overlapping amount.
fn start_scripted_broker(addr: SocketAddr) {
    let (relay, mut events) = RelayClient::start(relay_config(addr, BROKER_ID));
    tokio::spawn(async move {
        let mut entries: HashMap<OrderId, (OverlayId, OrderBookEntry)> = HashMap::new();
        let mut matched = false;

        while let Some(event) = events.recv().await {
            let RelayEvent::Message { from, payload } = event else {
                continue;
            };
            let Ok(BrokerMessage::Entry(entry)) = BrokerMessage::decode(&payload) else {
                continue;
            };
            entries.insert(entry.order_id, (from, entry));
            if matched {
                continue;
            }

            let bid = entries
                .values()
                .find(|(_, e)| e.side == Side::Bid && !e.amount.is_zero())
                .cloned();
            let ask = entries
                .values()
                .find(|(_, e)| e.side == Side::Ask && !e.amount.is_zero())
                .cloned();
            let (Some((bid_peer, bid_entry)), Some((ask_peer, ask_entry))) = (bid, ask) else {
                continue;
            };

            let amount = bid_entry.amount.min(ask_entry.amount);
            let fiat = fiat_value(&ask_entry.price, amount).expect("price fits").value;
            let exchange_id = ExchangeId::random();
            matched = true;

            for (order_id, counterpart, peer) in [
                (bid_entry.order_id, ask_peer, bid_peer),
                (ask_entry.order_id, bid_peer, ask_peer),
            ] {
                let message = BrokerMessage::Match(OrderMatch {
                    order_id,
                    exchange_id,
                    counterpart_id: counterpart,
                    bitcoin_amount: amount,
                    fiat_amount: fiat,
                });
                let _ = relay.send(peer, message.encode()).await;
            }
        }
    });
}

fn relay_config(addr: SocketAddr, id: OverlayId) -> RelayClientConfig {
    RelayClientConfig {
        connect_addr: addr.to_string(),
        local_id: id,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(500),
    }
}

struct DemoPeer {
    handle: TradingPeerHandle,
    wallet: Arc<InMemoryWallet>,
    payment: Arc<InMemoryPaymentProcessor>,
}

fn start_peer(
    addr: SocketAddr,
    hub: &Arc<InMemoryPaymentHub>,
    account: &str,
    fiat: FiatAmount,
    btc: BitcoinAmount,
) -> DemoPeer {
    let id = OverlayId::from_public_key(&TradeKeypair::generate().public_key());
    let wallet = InMemoryWallet::new(btc);
    let revocations = wallet.revocations();
    let payment = hub.open_account(account, fiat);
    let config = TradingPeerConfig {
        relay: relay_config(addr, id),
        exchange: ExchangeSettings {
            step_count: 4,
            handshake_timeout_secs: 10,
            step_timeout_secs: 10,
        },
        resubmit_interval: Duration::from_millis(250),
        retry_interval: Duration::from_millis(100),
    };
    let handle = TradingPeer::start(config, wallet.clone(), payment.clone(), revocations);
    DemoPeer {
        handle,
        wallet,
        payment,
    }
}

/// Drains an order's event stream to its terminal event, narrating
/// progress along the way.
async fn narrate_until_finished(
    name: &str,
    color: &str,
    events: &mut mpsc::UnboundedReceiver<OrderEvent>,
) -> OrderStatus {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("trade finishes well within a minute")
            .expect("stream open until Finished");
        match event {
            OrderEvent::Progressed { new, .. } => progress_bar(name, new, color),
            OrderEvent::StatusChanged { old, new } => {
                println!("  {DIM}{name}: {old} -> {BOLD}{new}{RESET}");
            }
            OrderEvent::Submitted { entry } => {
                println!(
                    "  {DIM}{name}: entry in book ({} @ {}){RESET}",
                    entry.amount, entry.price
                );
            }
            OrderEvent::Finished { status } => return status,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let demo_start = Instant::now();
    banner();

    // -----------------------------------------------------------------------
    // Step 1: Overlay Bootstrap
    // -----------------------------------------------------------------------

    section(1, "Relay Overlay Bootstrap");
    subsection("Binding the broker's relay server on an ephemeral port...");

    let t = Instant::now();
    let server = RelayServer::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = server.local_addr();
    tokio::spawn(server.run());
    start_scripted_broker(addr);
    timing("relay + broker startup", t.elapsed());

    info("Relay address", &addr.to_string());
    info("Broker overlay id", &BROKER_ID.to_hex());
    success("Star topology up: everyone connects to the center");

    // -----------------------------------------------------------------------
    // Step 2: Peers
    // -----------------------------------------------------------------------

    section(2, "Trading Peers");
    subsection("Starting a buyer (1,000 EUR) and a seller (3 BTC)...");

    let hub = InMemoryPaymentHub::new();
    let buyer = start_peer(
        addr,
        &hub,
        "buyer",
        FiatAmount::from_major(1_000, Currency::Eur),
        BitcoinAmount::from_btc(2),
    );
    let seller = start_peer(
        addr,
        &hub,
        "seller",
        FiatAmount::zero(Currency::Eur),
        BitcoinAmount::from_btc(3),
    );

    info("Buyer overlay id", &buyer.handle.local_id().to_hex());
    info("Seller overlay id", &seller.handle.local_id().to_hex());
    success("Both peers joined the overlay with fresh identities");

    // -----------------------------------------------------------------------
    // Step 3: Orders
    // -----------------------------------------------------------------------

    section(3, "Order Admission");
    subsection("Bid: 1 BTC @ 100 EUR/BTC.  Ask: 1 BTC @ 100 EUR/BTC.");

    let price = FiatAmount::from_major(100, Currency::Eur);
    let (_, mut buyer_events) = buyer
        .handle
        .submit_order(Side::Bid, BitcoinAmount::from_btc(1), price)
        .await
        .expect("buyer order admitted");
    let (_, mut seller_events) = seller
        .handle
        .submit_order(Side::Ask, BitcoinAmount::from_btc(1), price)
        .await
        .expect("seller order admitted");
    success("Funds blocking requested; orders head for the book");

    // -----------------------------------------------------------------------
    // Step 4: The Trade
    // -----------------------------------------------------------------------

    section(4, "Match and Step-Locked Exchange");
    subsection("The broker matches; four fiat/bitcoin micro-payments follow...");

    let t = Instant::now();
    let (buyer_status, seller_status) = tokio::join!(
        narrate_until_finished("buyer", BLUE, &mut buyer_events),
        narrate_until_finished("seller", GREEN, &mut seller_events),
    );
    timing("match + 4-step exchange", t.elapsed());

    assert_eq!(buyer_status, OrderStatus::Completed);
    assert_eq!(seller_status, OrderStatus::Completed);
    success("Both orders completed — every step paid for the one before it");

    // -----------------------------------------------------------------------
    // Final Summary
    // -----------------------------------------------------------------------

    // Give the controllers a moment to retire and release reservations.
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!();
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    DEMO COMPLETE -- Final Summary                                  {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!();

    println!("  {BOLD}{WHITE}Final Balances:{RESET}");
    println!("  {DIM}----------------------------------------------{RESET}");
    println!(
        "  {BLUE}{BOLD}Buyer{RESET}    {WHITE}{:>16}{RESET}   {WHITE}{:>16}{RESET}",
        buyer.payment.available(Currency::Eur).await.to_string(),
        buyer.wallet.available().await.to_string(),
    );
    println!(
        "  {GREEN}{BOLD}Seller{RESET}   {WHITE}{:>16}{RESET}   {WHITE}{:>16}{RESET}",
        seller.payment.available(Currency::Eur).await.to_string(),
        seller.wallet.available().await.to_string(),
    );
    println!();
    info("Steps per exchange", "4 (worst-case loss bounded to 1/4)");
    info("Messages", "length-prefixed frames over one TCP star");
    info("Broker's powers", "matching only — it never touched funds");
    println!();
    println!(
        "  {BOLD}{GREEN}Total demo time: {:.2}s{RESET}",
        demo_start.elapsed().as_secs_f64()
    );
    println!();
}
