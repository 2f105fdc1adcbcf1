//! # Funds blocker
//!
//! Before an order may go on the market, both legs of the trade are
//! reserved: bitcoin at the wallet, fiat at the payment processor. The
//! blocker is the single actor all reservation traffic goes through, so
//! two orders can never over-commit the same funds — requests are
//! serialized by its mailbox, not by locks.
//!
//! A reservation can die asynchronously (a wallet re-org invalidating
//! the UTXOs behind it); the blocker observes the wallet's revocation
//! stream and re-emits `Unavailable` for the affected order, which parks
//! it `Offline` until funds are blocked again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ids::OrderId;
use crate::money::{BitcoinAmount, FiatAmount};
use crate::payment::{FiatReservationId, PaymentProcessor};
use crate::wallet::{ReservationId, Wallet};

/// Mailbox capacity of the blocker actor.
const COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Events and commands
// ---------------------------------------------------------------------------

/// Reservation handles held for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedFunds {
    /// Bitcoin-side reservation, absent when the order needs none.
    pub bitcoin: Option<ReservationId>,
    /// Fiat-side reservation, absent when the order needs none.
    pub fiat: Option<FiatReservationId>,
}

/// What the blocker tells an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundsEvent {
    /// Both legs are reserved; the order may go on the market.
    Available {
        /// The order the reservation belongs to.
        order_id: OrderId,
        /// The reservation handles.
        funds: BlockedFunds,
    },
    /// At least one leg could not be (or is no longer) reserved.
    Unavailable {
        /// The affected order.
        order_id: OrderId,
    },
}

enum FundsCommand {
    Block {
        order_id: OrderId,
        fiat: FiatAmount,
        bitcoin: BitcoinAmount,
        events: mpsc::UnboundedSender<FundsEvent>,
    },
    Unblock {
        order_id: OrderId,
    },
}

/// Handle to the blocker actor.
#[derive(Clone)]
pub struct FundsBlockerHandle {
    commands: mpsc::Sender<FundsCommand>,
}

impl FundsBlockerHandle {
    /// Asks the blocker to reserve both legs for `order_id`. The outcome
    /// arrives on `events` as [`FundsEvent::Available`] or
    /// [`FundsEvent::Unavailable`]; later revocations re-use the same
    /// channel.
    pub async fn block(
        &self,
        order_id: OrderId,
        fiat: FiatAmount,
        bitcoin: BitcoinAmount,
        events: mpsc::UnboundedSender<FundsEvent>,
    ) {
        let _ = self
            .commands
            .send(FundsCommand::Block {
                order_id,
                fiat,
                bitcoin,
                events,
            })
            .await;
    }

    /// Releases both legs for `order_id`. Idempotent.
    pub async fn unblock(&self, order_id: OrderId) {
        let _ = self.commands.send(FundsCommand::Unblock { order_id }).await;
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct BlockedOrder {
    funds: BlockedFunds,
    events: mpsc::UnboundedSender<FundsEvent>,
}

/// Spawns the funds blocker actor.
pub struct FundsBlocker;

impl FundsBlocker {
    /// Spawns the actor over the process-wide wallet and payment
    /// processor. `revocations` is the wallet's revocation stream.
    pub fn spawn(
        wallet: Arc<dyn Wallet>,
        payment: Arc<dyn PaymentProcessor>,
        revocations: mpsc::UnboundedReceiver<ReservationId>,
    ) -> FundsBlockerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(run(wallet, payment, commands_rx, revocations));
        FundsBlockerHandle {
            commands: commands_tx,
        }
    }
}

async fn run(
    wallet: Arc<dyn Wallet>,
    payment: Arc<dyn PaymentProcessor>,
    mut commands: mpsc::Receiver<FundsCommand>,
    mut revocations: mpsc::UnboundedReceiver<ReservationId>,
) {
    let mut blocked: HashMap<OrderId, BlockedOrder> = HashMap::new();
    let mut revocations_open = true;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(FundsCommand::Block { order_id, fiat, bitcoin, events }) => {
                    block(&wallet, &payment, &mut blocked, order_id, fiat, bitcoin, events).await;
                }
                Some(FundsCommand::Unblock { order_id }) => {
                    unblock(&wallet, &payment, &mut blocked, order_id).await;
                }
                None => return,
            },
            revoked = revocations.recv(), if revocations_open => match revoked {
                Some(reservation) => {
                    revoke(&payment, &mut blocked, reservation).await;
                }
                // The wallet dropped its stream; reservations can no
                // longer be invalidated underneath us.
                None => revocations_open = false,
            },
        }
    }
}

async fn block(
    wallet: &Arc<dyn Wallet>,
    payment: &Arc<dyn PaymentProcessor>,
    blocked: &mut HashMap<OrderId, BlockedOrder>,
    order_id: OrderId,
    fiat: FiatAmount,
    bitcoin: BitcoinAmount,
    events: mpsc::UnboundedSender<FundsEvent>,
) {
    if let Some(existing) = blocked.get(&order_id) {
        // Blocking twice is answered from the standing reservation.
        let _ = events.send(FundsEvent::Available {
            order_id,
            funds: existing.funds,
        });
        return;
    }

    let fiat_leg = if fiat.is_zero() {
        None
    } else {
        match payment.reserve(fiat).await {
            Ok(reservation) => Some(reservation),
            Err(e) => {
                info!(%order_id, %e, "fiat reservation failed");
                let _ = events.send(FundsEvent::Unavailable { order_id });
                return;
            }
        }
    };

    let bitcoin_leg = if bitcoin.is_zero() {
        None
    } else {
        match wallet.reserve(bitcoin).await {
            Ok(reservation) => Some(reservation),
            Err(e) => {
                info!(%order_id, %e, "bitcoin reservation failed, rolling back fiat leg");
                if let Some(fiat_reservation) = fiat_leg {
                    payment.release(fiat_reservation).await;
                }
                let _ = events.send(FundsEvent::Unavailable { order_id });
                return;
            }
        }
    };

    let funds = BlockedFunds {
        bitcoin: bitcoin_leg,
        fiat: fiat_leg,
    };
    info!(%order_id, %fiat, %bitcoin, "funds blocked");
    let _ = events.send(FundsEvent::Available { order_id, funds });
    blocked.insert(order_id, BlockedOrder { funds, events });
}

async fn unblock(
    wallet: &Arc<dyn Wallet>,
    payment: &Arc<dyn PaymentProcessor>,
    blocked: &mut HashMap<OrderId, BlockedOrder>,
    order_id: OrderId,
) {
    let Some(entry) = blocked.remove(&order_id) else {
        debug!(%order_id, "unblock for unknown order ignored");
        return;
    };
    if let Some(reservation) = entry.funds.bitcoin {
        wallet.release(reservation).await;
    }
    if let Some(reservation) = entry.funds.fiat {
        payment.release(reservation).await;
    }
    info!(%order_id, "funds released");
}

async fn revoke(
    payment: &Arc<dyn PaymentProcessor>,
    blocked: &mut HashMap<OrderId, BlockedOrder>,
    reservation: ReservationId,
) {
    let Some(order_id) = blocked
        .iter()
        .find(|(_, entry)| entry.funds.bitcoin == Some(reservation))
        .map(|(order_id, _)| *order_id)
    else {
        debug!(%reservation, "revocation for untracked reservation");
        return;
    };

    warn!(%order_id, %reservation, "bitcoin reservation revoked, order funds unavailable");
    let entry = blocked.remove(&order_id).expect("looked up above");
    // The bitcoin leg is already gone; only the fiat leg can be freed.
    if let Some(fiat_reservation) = entry.funds.fiat {
        payment.release(fiat_reservation).await;
    }
    let _ = entry.events.send(FundsEvent::Unavailable { order_id });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
