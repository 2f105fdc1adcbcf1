//! # Relay client
//!
//! The peer side of the overlay: one connection to the relay server,
//! joined under the peer's overlay id. The client exposes a cheap
//! clonable [`RelayHandle`] for sending and a single event stream for
//! everything inbound.
//!
//! Disconnects are survived by a reconnect loop with bounded exponential
//! backoff plus jitter; on every reconnect the client re-joins under the
//! *same* id, so the server's last-writer-wins join semantics displace
//! any stale worker still draining on the other side. Outbound messages
//! queued while disconnected are dropped, not buffered — the overlay is
//! best-effort and the exchange protocol retransmits idempotently.

use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::wire::{read_frame, write_frame, Frame, JoinRequest, RelayMessage};
use super::RelayError;
use crate::config::{RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY};
use crate::ids::OverlayId;

/// Outbound command capacity. Filling it up applies send backpressure.
const OUTBOUND_CAPACITY: usize = 64;

/// Event stream capacity.
const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection parameters of a relay client.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// `host:port` of the relay server.
    pub connect_addr: String,
    /// Overlay id to join as — kept across reconnects.
    pub local_id: OverlayId,
    /// Base delay of the reconnect backoff.
    pub base_delay: Duration,
    /// Ceiling of the reconnect backoff.
    pub max_delay: Duration,
}

impl RelayClientConfig {
    /// Config with the default backoff envelope.
    pub fn new(connect_addr: impl Into<String>, local_id: OverlayId) -> Self {
        Self {
            connect_addr: connect_addr.into(),
            local_id,
            base_delay: RECONNECT_BASE_DELAY,
            max_delay: RECONNECT_MAX_DELAY,
        }
    }
}

// ---------------------------------------------------------------------------
// Events and handle
// ---------------------------------------------------------------------------

/// Everything the overlay tells a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The client (re)joined the relay. Carries the post-join network
    /// size from the join acknowledgement.
    Connected {
        /// Network size after this client joined.
        network_size: u32,
    },
    /// A unicast message, with the server-verified source.
    Message {
        /// Verified sender id.
        from: OverlayId,
        /// Opaque application payload.
        payload: Vec<u8>,
    },
    /// Membership changed.
    Status {
        /// Current network size.
        network_size: u32,
    },
    /// The connection dropped; the reconnect loop is running.
    Disconnected,
}

struct SendCommand {
    to: OverlayId,
    payload: Vec<u8>,
}

/// Clonable sending handle of a relay client.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<SendCommand>,
}

impl RelayHandle {
    /// Sends `payload` to `to`, best-effort. Succeeds as soon as the
    /// message is handed to the connection task; actual delivery is not
    /// acknowledged at this layer.
    pub async fn send(&self, to: OverlayId, payload: Vec<u8>) -> Result<(), RelayError> {
        self.tx
            .send(SendCommand { to, payload })
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// The relay client. [`start`](Self::start) spawns the connection task
/// and hands back the sending handle plus the event stream.
pub struct RelayClient;

impl RelayClient {
    /// Starts the client. The connection task lives until every handle
    /// is dropped or the event receiver goes away.
    pub fn start(config: RelayClientConfig) -> (RelayHandle, mpsc::Receiver<RelayEvent>) {
        let (command_tx, command_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        tokio::spawn(connection_task(config, command_rx, event_tx));
        (RelayHandle { tx: command_tx }, event_rx)
    }
}

enum SessionEnd {
    /// Connection lost; reconnect.
    Lost,
    /// All handles or the event receiver dropped; stop for good.
    Shutdown,
}

async fn connection_task(
    config: RelayClientConfig,
    mut commands: mpsc::Receiver<SendCommand>,
    events: mpsc::Sender<RelayEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_and_join(&config).await {
            Ok((stream, network_size)) => {
                attempt = 0;
                info!(id = %config.local_id, network_size, "joined relay");
                if events
                    .send(RelayEvent::Connected { network_size })
                    .await
                    .is_err()
                {
                    return;
                }
                match run_session(stream, &mut commands, &events).await {
                    SessionEnd::Lost => {
                        if events.send(RelayEvent::Disconnected).await.is_err() {
                            return;
                        }
                    }
                    SessionEnd::Shutdown => return,
                }
            }
            Err(e) => {
                debug!(addr = %config.connect_addr, error = %e, "relay connect failed");
            }
        }

        // Bounded exponential backoff with jitter. Outbound commands are
        // dropped while disconnected — the overlay never queues.
        let delay = backoff_delay(&config, attempt);
        attempt = attempt.saturating_add(1);
        debug!(?delay, attempt, "reconnecting after backoff");
        let drain_until = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(drain_until) => break,
                cmd = commands.recv() => match cmd {
                    Some(dropped) => {
                        warn!(to = %dropped.to, "dropping outbound message while disconnected");
                    }
                    None => return,
                },
            }
        }
    }
}

fn backoff_delay(config: &RelayClientConfig, attempt: u32) -> Duration {
    let exp = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(config.max_delay);
    // Up to +50% jitter so a herd of peers does not reconnect in phase.
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
    capped + Duration::from_millis(jitter_ms)
}

async fn connect_and_join(
    config: &RelayClientConfig,
) -> Result<(TcpStream, u32), RelayError> {
    let mut stream = TcpStream::connect(&config.connect_addr)
        .await
        .map_err(|e| RelayError::Wire(e.into()))?;
    write_frame(&mut stream, &JoinRequest { id: config.local_id }.into_frame()).await?;
    match read_frame(&mut stream).await? {
        Frame::Status(status) => Ok((stream, status.network_size)),
        Frame::Relay(_) => Err(RelayError::NotConnected),
    }
}

async fn run_session(
    stream: TcpStream,
    commands: &mut mpsc::Receiver<SendCommand>,
    events: &mpsc::Sender<RelayEvent>,
) -> SessionEnd {
    let (mut read_half, mut write_half) = stream.into_split();

    // Dedicated reader task: `read_frame` is not cancel-safe inside a
    // select, so frames flow through their own channel instead.
    let (frame_tx, mut frames) = mpsc::channel::<Frame>(EVENT_CAPACITY);
    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "relay read ended");
                    return;
                }
            }
        }
    });

    let end = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SendCommand { to, payload }) => {
                    let frame = Frame::Relay(RelayMessage {
                        endpoint_id: to,
                        payload,
                    });
                    if let Err(e) = write_frame(&mut write_half, &frame).await {
                        debug!(error = %e, "relay write failed");
                        break SessionEnd::Lost;
                    }
                }
                None => break SessionEnd::Shutdown,
            },
            frame = frames.recv() => match frame {
                Some(Frame::Status(status)) => {
                    if events
                        .send(RelayEvent::Status { network_size: status.network_size })
                        .await
                        .is_err()
                    {
                        break SessionEnd::Shutdown;
                    }
                }
                Some(Frame::Relay(message)) => {
                    if events
                        .send(RelayEvent::Message {
                            from: message.endpoint_id,
                            payload: message.payload,
                        })
                        .await
                        .is_err()
                    {
                        break SessionEnd::Shutdown;
                    }
                }
                None => break SessionEnd::Lost,
            },
        }
    };

    reader.abort();
    end
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TradeKeypair;
    use crate::relay::server::RelayServer;
    use crate::relay::wire::StatusMessage;
    use tokio::net::TcpListener;

    fn fresh_id() -> OverlayId {
        OverlayId::from_public_key(&TradeKeypair::generate().public_key())
    }

    fn fast_config(addr: impl Into<String>, id: OverlayId) -> RelayClientConfig {
        RelayClientConfig {
            connect_addr: addr.into(),
            local_id: id,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    async fn start_server() -> std::net::SocketAddr {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());
        addr
    }

    async fn next_non_status(events: &mut mpsc::Receiver<RelayEvent>) -> RelayEvent {
        loop {
            match events.recv().await.expect("event stream open") {
                RelayEvent::Status { .. } => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn connects_and_reports_network_size() {
        let addr = start_server().await;
        let (_handle, mut events) = RelayClient::start(fast_config(addr.to_string(), fresh_id()));

        assert_eq!(
            events.recv().await,
            Some(RelayEvent::Connected { network_size: 1 })
        );
    }

    #[tokio::test]
    async fn two_clients_exchange_messages() {
        let addr = start_server().await;
        let id_a = fresh_id();
        let id_b = fresh_id();

        let (handle_a, mut events_a) = RelayClient::start(fast_config(addr.to_string(), id_a));
        let (handle_b, mut events_b) = RelayClient::start(fast_config(addr.to_string(), id_b));
        assert!(matches!(
            next_non_status(&mut events_a).await,
            RelayEvent::Connected { .. }
        ));
        assert!(matches!(
            next_non_status(&mut events_b).await,
            RelayEvent::Connected { .. }
        ));

        handle_a.send(id_b, b"ping".to_vec()).await.unwrap();
        let event = next_non_status(&mut events_b).await;
        assert_eq!(
            event,
            RelayEvent::Message {
                from: id_a,
                payload: b"ping".to_vec(),
            }
        );

        handle_b.send(id_a, b"pong".to_vec()).await.unwrap();
        let event = next_non_status(&mut events_a).await;
        assert_eq!(
            event,
            RelayEvent::Message {
                from: id_b,
                payload: b"pong".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn retries_until_server_appears() {
        // Reserve a port, then release it so the client's first attempts
        // fail before the real server comes up.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        let (_handle, mut events) = RelayClient::start(fast_config(addr.to_string(), fresh_id()));
        tokio::time::sleep(Duration::from_millis(40)).await;

        let server = RelayServer::bind(&addr.to_string()).await.unwrap();
        tokio::spawn(server.run());

        assert_eq!(
            events.recv().await,
            Some(RelayEvent::Connected { network_size: 1 })
        );
    }

    #[tokio::test]
    async fn reconnects_and_rejoins_with_same_id() {
        // Hand-rolled single-shot server: accept, ack the join, hang up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let id = fresh_id();

        let (_handle, mut events) = RelayClient::start(fast_config(addr.to_string(), id));

        let (mut conn, _) = listener.accept().await.unwrap();
        let join = read_frame(&mut conn).await.unwrap();
        let Frame::Relay(message) = join else {
            panic!("expected join relay frame");
        };
        assert_eq!(JoinRequest::decode(&message.payload).unwrap().id, id);
        write_frame(
            &mut conn,
            &Frame::Status(StatusMessage { network_size: 1 }),
        )
        .await
        .unwrap();
        assert_eq!(
            events.recv().await,
            Some(RelayEvent::Connected { network_size: 1 })
        );

        // Server "restarts": connection dies, the real relay takes over
        // the same port. The client must re-join under the same id.
        drop(conn);
        drop(listener);
        assert_eq!(events.recv().await, Some(RelayEvent::Disconnected));

        let server = RelayServer::bind(&addr.to_string()).await.unwrap();
        tokio::spawn(server.run());

        assert_eq!(
            events.recv().await,
            Some(RelayEvent::Connected { network_size: 1 })
        );
    }
}
