//! # Step-locked exchange
//!
//! One matched counterparty pair working through a fair exchange of
//! bitcoin against fiat. The trade amount is split into `N` micro
//! payments; each on-chain release is bought with one off-chain fiat
//! payment, so an aborting counterpart can cost an honest party at most
//! `1/N` of the trade.
//!
//! ```text
//! NonStarted ──start_handshake──▶ Handshaking ──start_exchange──▶ Exchanging (k/N)
//!                                     │                               │   │
//!                                     ├─abort──▶ Aborted              │   ├─complete_step(N)─▶ Successful
//!                                     │                               │   │
//!                                     ▼                               ▼   ▼
//!                                   Failed                          Failed
//! ```
//!
//! The module splits the problem the way the settlement tracker does:
//!
//! - [`machine`] — the pure state machine. Total over its inputs, never
//!   panics, trivially unit-testable.
//! - [`messages`] — the peer-to-peer message set, idempotent under the
//!   `(exchange_id, step)` key.
//! - [`runner`] — the actor that drives one machine against the wallet,
//!   the payment processor and the relay, with timeouts.

pub mod machine;
pub mod messages;
pub mod runner;

pub use machine::{
    Deposits, ExchangeParams, ExchangePhase, ExchangeRole, ExchangeSnapshot, ExchangeStateMachine,
    InvalidTransition, PeerInfo, StepOutcome,
};
pub use messages::TradeMessage;
pub use runner::{
    ExchangeContext, ExchangeError, ExchangeEvent, ExchangeEventSink, ExchangeRunner,
    ExchangeRunnerHandle,
};
