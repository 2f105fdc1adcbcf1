//! # Relay server
//!
//! The broker-side center of the star. One registry task owns the only
//! `id → worker` mapping in the process; per-connection workers never
//! touch it directly, they talk to the registry over its mailbox. That
//! keeps the join/forward/disconnect logic single-threaded and the
//! membership invariants trivial to reason about.
//!
//! Join semantics are last-writer-wins: a second connection joining under
//! an already-mapped id takes the id over, and the previous worker is
//! told to terminate. This is what lets a peer whose half-open connection
//! is still draining on the server side reconnect immediately.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::wire::{read_frame, write_frame, Frame, JoinRequest, RelayMessage, StatusMessage};
use super::RelayError;
use crate::ids::OverlayId;

/// Outbound capacity per worker. The overlay is best-effort: when a slow
/// consumer fills this up, further frames for it are dropped, not queued.
const WORKER_OUTBOUND_CAPACITY: usize = 64;

/// Registry mailbox capacity.
const REGISTRY_CAPACITY: usize = 256;

/// Connection serial, used to tell two sockets joining under the same
/// overlay id apart.
type ConnId = u64;

enum WorkerMessage {
    Frame(Frame),
    Terminate,
}

enum RegistryCommand {
    Join {
        conn: ConnId,
        id: OverlayId,
        outbound: mpsc::Sender<WorkerMessage>,
    },
    Relay {
        conn: ConnId,
        to: OverlayId,
        payload: Vec<u8>,
    },
    Disconnected {
        conn: ConnId,
    },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The relay server. Bind first (binding failure is fatal at start),
/// then [`run`](Self::run) the accept loop.
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    size_tx: watch::Sender<u32>,
}

impl RelayServer {
    /// Binds the server socket. A bind failure is fatal to startup and
    /// reported as [`RelayError::Bind`].
    pub async fn bind(addr: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!(%local_addr, "relay server bound");
        let (size_tx, _) = watch::channel(0);
        Ok(Self {
            listener,
            local_addr,
            size_tx,
        })
    }

    /// The actual bound address (relevant when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Watch of the current network size, for operator metrics.
    pub fn network_size(&self) -> watch::Receiver<u32> {
        self.size_tx.subscribe()
    }

    /// Runs the accept loop forever. Each connection gets its own worker
    /// pair of tasks; the registry task is spawned once here.
    pub async fn run(self) -> Result<(), RelayError> {
        let (registry_tx, registry_rx) = mpsc::channel(REGISTRY_CAPACITY);
        tokio::spawn(registry_task(registry_rx, self.size_tx.clone()));

        let mut next_conn: ConnId = 0;
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed, continuing");
                    continue;
                }
            };
            next_conn += 1;
            let conn = next_conn;
            debug!(conn, %peer_addr, "connection accepted");
            tokio::spawn(worker_task(conn, stream, registry_tx.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Registry {
    by_id: HashMap<OverlayId, (ConnId, mpsc::Sender<WorkerMessage>)>,
    by_conn: HashMap<ConnId, OverlayId>,
}

impl Registry {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_conn: HashMap::new(),
        }
    }

    fn network_size(&self) -> u32 {
        self.by_id.len() as u32
    }

    fn status_frame(&self) -> Frame {
        Frame::Status(StatusMessage {
            network_size: self.network_size(),
        })
    }

    fn send_to(&self, id: &OverlayId, message: WorkerMessage) {
        if let Some((conn, outbound)) = self.by_id.get(id) {
            if outbound.try_send(message).is_err() {
                warn!(%id, conn, "worker outbound full or gone, frame dropped");
            }
        }
    }

    fn broadcast_status(&self) {
        let frame = self.status_frame();
        for (id, (conn, outbound)) in &self.by_id {
            if outbound
                .try_send(WorkerMessage::Frame(frame.clone()))
                .is_err()
            {
                warn!(%id, conn, "status broadcast dropped for worker");
            }
        }
    }

    fn join(&mut self, conn: ConnId, id: OverlayId, outbound: mpsc::Sender<WorkerMessage>) {
        // Last-writer-wins: the previous holder of the id is told to go.
        if let Some((old_conn, old_outbound)) = self.by_id.remove(&id) {
            info!(%id, old_conn, new_conn = conn, "endpoint id taken over");
            self.by_conn.remove(&old_conn);
            if old_outbound.try_send(WorkerMessage::Terminate).is_err() {
                warn!(%id, old_conn, "terminate signal dropped, worker already draining");
            }
        }

        self.by_id.insert(id, (conn, outbound));
        self.by_conn.insert(conn, id);
        info!(%id, conn, network_size = self.network_size(), "endpoint joined");

        // Acknowledge the join with the post-join status, then notify
        // everyone of the new membership.
        self.send_to(&id, WorkerMessage::Frame(self.status_frame()));
        self.broadcast_status();
    }

    fn relay(&self, conn: ConnId, to: OverlayId, payload: Vec<u8>) {
        // The source must be a joined worker; frames from a connection
        // that never joined are dropped.
        let Some(from) = self.by_conn.get(&conn) else {
            warn!(conn, "relay from unjoined connection dropped");
            return;
        };
        if self.by_id.contains_key(&to) {
            let frame = Frame::Relay(RelayMessage {
                endpoint_id: *from,
                payload,
            });
            self.send_to(&to, WorkerMessage::Frame(frame));
        } else {
            debug!(%from, %to, "relay to unknown endpoint dropped");
        }
    }

    fn disconnected(&mut self, conn: ConnId) {
        let Some(id) = self.by_conn.remove(&conn) else {
            return; // never joined, or already replaced by a takeover
        };
        // A takeover may have re-bound the id to a newer connection.
        if self.by_id.get(&id).is_some_and(|(c, _)| *c == conn) {
            self.by_id.remove(&id);
            info!(%id, conn, network_size = self.network_size(), "endpoint left");
            self.broadcast_status();
        }
    }
}

async fn registry_task(mut rx: mpsc::Receiver<RegistryCommand>, size_tx: watch::Sender<u32>) {
    let mut registry = Registry::new();
    while let Some(command) = rx.recv().await {
        match command {
            RegistryCommand::Join { conn, id, outbound } => registry.join(conn, id, outbound),
            RegistryCommand::Relay { conn, to, payload } => registry.relay(conn, to, payload),
            RegistryCommand::Disconnected { conn } => registry.disconnected(conn),
        }
        // Observers only care about the value, not the edge count.
        size_tx.send_if_modified(|size| {
            let new = registry.network_size();
            let changed = *size != new;
            *size = new;
            changed
        });
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn worker_task(conn: ConnId, stream: TcpStream, registry: mpsc::Sender<RegistryCommand>) {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(WORKER_OUTBOUND_CAPACITY);

    let writer = tokio::spawn(writer_task(conn, write_half, outbound_rx));
    read_loop(conn, read_half, &registry, outbound_tx).await;

    let _ = registry.send(RegistryCommand::Disconnected { conn }).await;
    writer.abort();
    debug!(conn, "worker finished");
}

async fn writer_task<W>(conn: ConnId, mut write_half: W, mut rx: mpsc::Receiver<WorkerMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Frame(frame) => {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    debug!(conn, error = %e, "write failed, closing worker");
                    return;
                }
            }
            WorkerMessage::Terminate => {
                debug!(conn, "worker terminated by takeover");
                return;
            }
        }
    }
}

async fn read_loop<R>(
    conn: ConnId,
    mut read_half: R,
    registry: &mpsc::Sender<RegistryCommand>,
    outbound_tx: mpsc::Sender<WorkerMessage>,
) where
    R: AsyncRead + Unpin,
{
    // The first frame must be a join; anything else closes the socket.
    let join = match read_frame(&mut read_half).await {
        Ok(Frame::Relay(message)) => match JoinRequest::decode(&message.payload) {
            Ok(join) => join,
            Err(e) => {
                warn!(conn, error = %e, "first frame is not a join, closing");
                return;
            }
        },
        Ok(Frame::Status(_)) => {
            warn!(conn, "client sent a status frame before joining, closing");
            return;
        }
        Err(e) => {
            debug!(conn, error = %e, "connection closed before join");
            return;
        }
    };

    if registry
        .send(RegistryCommand::Join {
            conn,
            id: join.id,
            outbound: outbound_tx.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        match read_frame(&mut read_half).await {
            Ok(Frame::Relay(message)) => {
                if registry
                    .send(RegistryCommand::Relay {
                        conn,
                        to: message.endpoint_id,
                        payload: message.payload,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Frame::Status(_)) => {
                // Status is server-to-client only; a client sending one is
                // confused but harmless.
                debug!(conn, "ignoring client status frame");
            }
            Err(e) => {
                debug!(conn, error = %e, "read loop ended");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
