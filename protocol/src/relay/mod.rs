//! # Relay overlay
//!
//! A star-topology message bus. Every participant — peers and the broker
//! alike — holds exactly one TCP connection to the broker's relay server;
//! peer-to-peer traffic is forwarded through the center.
//!
//! ```text
//!        ┌────────┐            ┌────────┐
//!        │ peer A │            │ peer B │
//!        └───┬────┘            └────┬───┘
//!            │  Relay(to=B, m)      │
//!            ▼                      │
//!        ┌───────────────┐          │
//!        │ relay server  │──────────┘
//!        │ (id → worker) │  Relay(from=A, m)
//!        └───────┬───────┘
//!                │ Status(network_size) on every membership change
//!                ▼
//!           all workers
//! ```
//!
//! Delivery is best-effort unicast: the overlay does not queue beyond the
//! TCP socket buffer, and loss during a server restart is not masked.
//! Higher layers tolerate loss through idempotent retransmission.
//!
//! - [`wire`] — the length-prefixed frame codec shared by both ends.
//! - [`server`] — the broker-side relay with the only `id → worker` map.
//! - [`client`] — the peer-side client with its reconnect loop.

pub mod client;
pub mod server;
pub mod wire;

use thiserror::Error;

pub use client::{RelayClient, RelayClientConfig, RelayEvent, RelayHandle};
pub use server::RelayServer;
pub use wire::{Frame, JoinRequest, RelayMessage, StatusMessage, WireError};

/// Errors of the relay overlay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The server socket could not be bound. Fatal at start.
    #[error("cannot bind relay server on {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: String,
        /// The underlying socket error.
        source: std::io::Error,
    },

    /// Frame codec or socket failure on an established connection.
    /// Non-fatal: the client reconnects, the server drops the worker.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The client is not currently connected and the send was dropped.
    #[error("relay client is not connected")]
    NotConnected,

    /// An internal mailbox closed; the owning task is gone.
    #[error("relay channel closed")]
    ChannelClosed,
}
