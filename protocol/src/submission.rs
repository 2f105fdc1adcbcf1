//! # Submission supervisor
//!
//! Keeps the orders a user wants traded visible in the broker's book.
//! The broker treats the absence of refreshes as implicit withdrawal, so
//! the supervisor re-publishes every live entry on a fixed cadence — an
//! idempotent keep-alive. It also re-publishes immediately whenever the
//! relay client reconnects, because a broker restart wipes its book.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerMessage, OrderBookEntry};
use crate::ids::{OrderId, BROKER_ID};
use crate::relay::RelayHandle;

/// Mailbox capacity of the supervisor actor.
const COMMAND_CAPACITY: usize = 64;

enum SubmissionCommand {
    Keep {
        entry: OrderBookEntry,
        notify: mpsc::UnboundedSender<OrderId>,
    },
    Stop {
        order_id: OrderId,
    },
    Connected,
}

/// Handle to the supervisor actor.
#[derive(Clone)]
pub struct SubmissionHandle {
    commands: mpsc::Sender<SubmissionCommand>,
}

impl SubmissionHandle {
    /// Adds (or refreshes) a live entry and publishes it immediately.
    /// Every successful publication of the entry is reported on `notify`.
    pub async fn keep_submitting(
        &self,
        entry: OrderBookEntry,
        notify: mpsc::UnboundedSender<OrderId>,
    ) {
        let _ = self
            .commands
            .send(SubmissionCommand::Keep { entry, notify })
            .await;
    }

    /// Drops an entry. The broker forgets it once refreshes stop.
    pub async fn stop_submitting(&self, order_id: OrderId) {
        let _ = self
            .commands
            .send(SubmissionCommand::Stop { order_id })
            .await;
    }

    /// Tells the supervisor the relay reconnected: all entries are
    /// re-published at once.
    pub async fn connected(&self) {
        let _ = self.commands.send(SubmissionCommand::Connected).await;
    }
}

/// Spawns submission supervisor actors.
pub struct SubmissionSupervisor;

impl SubmissionSupervisor {
    /// Spawns the actor. `resubmit_interval` is the keep-alive cadence
    /// (see [`RESUBMIT_INTERVAL`](crate::config::RESUBMIT_INTERVAL) for
    /// the production value).
    pub fn spawn(relay: RelayHandle, resubmit_interval: Duration) -> SubmissionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(run(relay, resubmit_interval, commands_rx));
        SubmissionHandle {
            commands: commands_tx,
        }
    }
}

struct LiveEntry {
    entry: OrderBookEntry,
    notify: mpsc::UnboundedSender<OrderId>,
}

async fn run(
    relay: RelayHandle,
    resubmit_interval: Duration,
    mut commands: mpsc::Receiver<SubmissionCommand>,
) {
    let mut live: HashMap<OrderId, LiveEntry> = HashMap::new();
    let mut tick = tokio::time::interval(resubmit_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SubmissionCommand::Keep { entry, notify }) => {
                    let order_id = entry.order_id;
                    info!(%order_id, "keeping order in the broker book");
                    let live_entry = LiveEntry { entry, notify };
                    publish(&relay, &live_entry).await;
                    live.insert(order_id, live_entry);
                }
                Some(SubmissionCommand::Stop { order_id }) => {
                    if live.remove(&order_id).is_some() {
                        info!(%order_id, "stopped submitting order");
                    } else {
                        debug!(%order_id, "stop for unknown order ignored");
                    }
                }
                Some(SubmissionCommand::Connected) => {
                    debug!(entries = live.len(), "relay reconnected, re-publishing book entries");
                    for live_entry in live.values() {
                        publish(&relay, live_entry).await;
                    }
                }
                None => return,
            },
            _ = tick.tick() => {
                for live_entry in live.values() {
                    publish(&relay, live_entry).await;
                }
            }
        }
    }
}

async fn publish(relay: &RelayHandle, live_entry: &LiveEntry) {
    let message = BrokerMessage::Entry(live_entry.entry.clone());
    match relay.send(BROKER_ID, message.encode()).await {
        Ok(()) => {
            let _ = live_entry.notify.send(live_entry.entry.order_id);
        }
        Err(e) => {
            warn!(order_id = %live_entry.entry.order_id, %e, "entry publication failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TradeKeypair;
    use crate::ids::OverlayId;
    use crate::money::{BitcoinAmount, Currency, FiatAmount};
    use crate::order::Side;
    use crate::relay::client::{RelayClient, RelayClientConfig, RelayEvent};
    use crate::relay::server::RelayServer;

    fn entry(order_id: OrderId) -> OrderBookEntry {
        OrderBookEntry {
            order_id,
            side: Side::Bid,
            amount: BitcoinAmount::from_btc(1),
            price: FiatAmount::from_major(100, Currency::Eur),
        }
    }

    async fn setup() -> (SubmissionHandle, mpsc::Receiver<RelayEvent>) {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());

        // The broker end of the relay, receiving the publications.
        let (_broker, broker_events) = RelayClient::start(RelayClientConfig {
            connect_addr: addr.to_string(),
            local_id: BROKER_ID,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        });

        // The peer end, feeding the supervisor.
        let peer_id = OverlayId::from_public_key(&TradeKeypair::generate().public_key());
        let (peer_relay, mut peer_events) = RelayClient::start(RelayClientConfig {
            connect_addr: addr.to_string(),
            local_id: peer_id,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        });
        loop {
            if let Some(RelayEvent::Connected { .. }) = peer_events.recv().await {
                break;
            }
        }

        let handle = SubmissionSupervisor::spawn(peer_relay, Duration::from_millis(40));
        (handle, broker_events)
    }

    async fn next_entry(events: &mut mpsc::Receiver<RelayEvent>) -> OrderBookEntry {
        loop {
            match events.recv().await.expect("broker stream open") {
                RelayEvent::Message { payload, .. } => {
                    if let Ok(BrokerMessage::Entry(entry)) = BrokerMessage::decode(&payload) {
                        return entry;
                    }
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn publishes_immediately_and_notifies() {
        let (handle, mut broker_events) = setup().await;
        let order_id = OrderId::random();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();

        handle.keep_submitting(entry(order_id), notify_tx).await;

        assert_eq!(next_entry(&mut broker_events).await.order_id, order_id);
        assert_eq!(notify_rx.recv().await, Some(order_id));
    }

    #[tokio::test]
    async fn republishes_on_interval() {
        let (handle, mut broker_events) = setup().await;
        let order_id = OrderId::random();
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();

        handle.keep_submitting(entry(order_id), notify_tx).await;

        // Initial publication plus at least two keep-alive refreshes.
        for _ in 0..3 {
            assert_eq!(next_entry(&mut broker_events).await.order_id, order_id);
        }
    }

    #[tokio::test]
    async fn stop_submitting_stops_refreshes() {
        let (handle, mut broker_events) = setup().await;
        let order_id = OrderId::random();
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();

        handle.keep_submitting(entry(order_id), notify_tx).await;
        assert_eq!(next_entry(&mut broker_events).await.order_id, order_id);

        handle.stop_submitting(order_id).await;
        // Drain anything already in flight, then expect silence.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = broker_events.try_recv() {
            drop(event);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker_events.try_recv().is_err());
    }
}
