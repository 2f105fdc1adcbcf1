//! # Trading peer
//!
//! The top-level runtime entity of one marketplace participant. It owns
//! the relay client, the funds blocker, the submission supervisor and
//! one controller per order, and it is the router for everything the
//! overlay delivers:
//!
//! - frames from the broker's id are decoded as broker messages and
//!   dispatched to the owning order controller;
//! - frames from anyone else are decoded as trade messages and
//!   dispatched by their exchange id.
//!
//! The engine itself holds no trading state beyond the routing tables —
//! every decision lives in the controllers and runners.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::BrokerMessage;
use crate::config::{ExchangeSettings, Settings, RESUBMIT_INTERVAL, TRADE_RETRY_INTERVAL};
use crate::exchange::TradeMessage;
use crate::funds::FundsBlocker;
use crate::ids::{ExchangeId, OrderId, OverlayId};
use crate::money::{BitcoinAmount, FiatAmount};
use crate::order::{Order, OrderController, OrderControllerDeps, OrderEvent, Side};
use crate::payment::PaymentProcessor;
use crate::relay::{RelayClient, RelayClientConfig, RelayEvent};
use crate::submission::SubmissionSupervisor;
use crate::wallet::{ReservationId, Wallet};

/// Engine mailbox capacity.
const COMMAND_CAPACITY: usize = 64;

/// The engine stopped; its mailbox or relay task is gone.
#[derive(Debug, Error)]
#[error("trading peer is not running")]
pub struct PeerStopped;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime wiring of a trading peer.
#[derive(Clone)]
pub struct TradingPeerConfig {
    /// Relay client parameters.
    pub relay: RelayClientConfig,
    /// Exchange protocol options.
    pub exchange: ExchangeSettings,
    /// Book keep-alive cadence.
    pub resubmit_interval: Duration,
    /// Trade retransmission cadence.
    pub retry_interval: Duration,
}

impl TradingPeerConfig {
    /// Production wiring from validated [`Settings`].
    pub fn from_settings(settings: &Settings, local_id: OverlayId) -> Self {
        Self {
            relay: RelayClientConfig::new(settings.relay.connect_addr(), local_id),
            exchange: settings.exchange.clone(),
            resubmit_interval: RESUBMIT_INTERVAL,
            retry_interval: TRADE_RETRY_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands and handle
// ---------------------------------------------------------------------------

enum PeerCommand {
    SubmitOrder {
        side: Side,
        amount: BitcoinAmount,
        price: FiatAmount,
        reply: oneshot::Sender<(OrderId, mpsc::UnboundedReceiver<OrderEvent>)>,
    },
    CancelOrder {
        order_id: OrderId,
        reason: String,
    },
}

/// Handle to a running trading peer.
#[derive(Clone)]
pub struct TradingPeerHandle {
    local_id: OverlayId,
    commands: mpsc::Sender<PeerCommand>,
}

impl TradingPeerHandle {
    /// This peer's overlay id.
    pub fn local_id(&self) -> OverlayId {
        self.local_id
    }

    /// Creates and admits a new order. Returns its id and event stream;
    /// the order goes on the market once its funds are blocked.
    pub async fn submit_order(
        &self,
        side: Side,
        amount: BitcoinAmount,
        price: FiatAmount,
    ) -> Result<(OrderId, mpsc::UnboundedReceiver<OrderEvent>), PeerStopped> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PeerCommand::SubmitOrder {
                side,
                amount,
                price,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PeerStopped)?;
        reply_rx.await.map_err(|_| PeerStopped)
    }

    /// Cancels an order. Non-preemptive towards a running exchange.
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        reason: impl Into<String>,
    ) -> Result<(), PeerStopped> {
        self.commands
            .send(PeerCommand::CancelOrder {
                order_id,
                reason: reason.into(),
            })
            .await
            .map_err(|_| PeerStopped)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The trading engine of one peer.
pub struct TradingPeer;

impl TradingPeer {
    /// Starts the engine: relay client, funds blocker, submission
    /// supervisor, and the routing loop. `revocations` is the wallet's
    /// reservation revocation stream.
    pub fn start(
        config: TradingPeerConfig,
        wallet: Arc<dyn Wallet>,
        payment: Arc<dyn PaymentProcessor>,
        revocations: mpsc::UnboundedReceiver<ReservationId>,
    ) -> TradingPeerHandle {
        let local_id = config.relay.local_id;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(run(config, wallet, payment, revocations, commands_rx));
        TradingPeerHandle {
            local_id,
            commands: commands_tx,
        }
    }
}

async fn run(
    config: TradingPeerConfig,
    wallet: Arc<dyn Wallet>,
    payment: Arc<dyn PaymentProcessor>,
    revocations: mpsc::UnboundedReceiver<ReservationId>,
    mut commands: mpsc::Receiver<PeerCommand>,
) {
    let local_id = config.relay.local_id;
    let (relay, mut relay_events) = RelayClient::start(config.relay.clone());
    let funds = FundsBlocker::spawn(wallet.clone(), payment.clone(), revocations);
    let submission = SubmissionSupervisor::spawn(relay.clone(), config.resubmit_interval);
    let blacklist: Arc<RwLock<HashSet<OverlayId>>> = Arc::new(RwLock::new(HashSet::new()));

    let mut controllers: HashMap<OrderId, crate::order::OrderControllerHandle> = HashMap::new();
    let mut exchange_owner: HashMap<ExchangeId, OrderId> = HashMap::new();

    // Controllers announce their retirement here so the routing tables
    // shrink with them. The engine keeps `retired_tx` alive, so the
    // stream never closes underneath the select.
    let (retired_tx, mut retired_rx) = mpsc::unbounded_channel::<OrderId>();

    info!(%local_id, "trading peer started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::SubmitOrder { side, amount, price, reply }) => {
                    let order = Order::new(OrderId::random(), side, amount, price);
                    let order_id = order.id();
                    info!(%order_id, %side, %amount, "order admitted");
                    let deps = OrderControllerDeps {
                        local_id,
                        wallet: wallet.clone(),
                        payment: payment.clone(),
                        relay: relay.clone(),
                        funds: funds.clone(),
                        submission: submission.clone(),
                        exchange: config.exchange.clone(),
                        blacklist: blacklist.clone(),
                        retry_interval: config.retry_interval,
                        retired: retired_tx.clone(),
                    };
                    let (handle, events) = OrderController::spawn(order, deps);
                    controllers.insert(order_id, handle);
                    let _ = reply.send((order_id, events));
                }
                Some(PeerCommand::CancelOrder { order_id, reason }) => {
                    match controllers.get(&order_id) {
                        Some(controller) => controller.cancel(reason).await,
                        None => debug!(%order_id, "cancel for unknown order ignored"),
                    }
                }
                None => break,
            },
            retired = retired_rx.recv() => match retired {
                Some(order_id) => {
                    // Terminal order with every child exchange terminated:
                    // destroy it and its routing entries.
                    controllers.remove(&order_id);
                    exchange_owner.retain(|_, owner| *owner != order_id);
                    debug!(%order_id, "retired order pruned from routing tables");
                }
                // Unreachable while the engine holds `retired_tx`.
                None => break,
            },
            event = relay_events.recv() => match event {
                Some(RelayEvent::Connected { network_size }) => {
                    info!(network_size, "relay joined, re-publishing book entries");
                    submission.connected().await;
                }
                Some(RelayEvent::Disconnected) => {
                    debug!("relay connection lost, reconnect in progress");
                }
                Some(RelayEvent::Status { network_size }) => {
                    debug!(network_size, "overlay membership changed");
                }
                Some(RelayEvent::Message { from, payload }) => {
                    route_message(
                        from,
                        &payload,
                        &controllers,
                        &mut exchange_owner,
                    )
                    .await;
                }
                None => break,
            },
        }
    }

    info!(%local_id, "trading peer stopped");
}

async fn route_message(
    from: OverlayId,
    payload: &[u8],
    controllers: &HashMap<OrderId, crate::order::OrderControllerHandle>,
    exchange_owner: &mut HashMap<ExchangeId, OrderId>,
) {
    if from.is_broker() {
        match BrokerMessage::decode(payload) {
            Ok(BrokerMessage::Match(m)) => match controllers.get(&m.order_id) {
                Some(controller) => {
                    exchange_owner.insert(m.exchange_id, m.order_id);
                    controller.order_match(m).await;
                }
                None => warn!(order_id = %m.order_id, "match for unknown order dropped"),
            },
            Ok(other) => {
                debug!("ignoring broker message {:?}", std::mem::discriminant(&other));
            }
            Err(e) => warn!(%from, %e, "undecodable broker message dropped"),
        }
        return;
    }

    match TradeMessage::decode(payload) {
        Ok(message) => {
            let exchange_id = message.exchange_id();
            let Some(order_id) = exchange_owner.get(&exchange_id) else {
                debug!(%from, %exchange_id, "trade message for unknown exchange dropped");
                return;
            };
            match controllers.get(order_id) {
                Some(controller) => controller.trade_message(message).await,
                None => debug!(%order_id, "trade message for retired order dropped"),
            }
        }
        Err(e) => warn!(%from, %e, "undecodable trade message dropped"),
    }
}
