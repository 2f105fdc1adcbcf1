// Copyright (c) 2026 Stepswap Labs. MIT License.
// See LICENSE for details.

//! # stepswap — Core Trading Engine
//!
//! The trading engine of one peer in a marketplace for trustless
//! exchange of bitcoin against fiat. Two matched counterparties run a
//! **step-locked fair exchange**: the trade is cut into `N` micro
//! payments, each on-chain bitcoin release bought with one off-chain
//! fiat payment, so an aborting counterpart costs an honest party at
//! most `1/N` of the trade. A central broker matches orders and relays
//! messages — it never touches funds.
//!
//! ## Architecture
//!
//! The crate is split along the actual runtime actors:
//!
//! - **relay** — the star-topology overlay: framed TCP server and a
//!   reconnecting client.
//! - **broker** — the order-book wire protocol spoken with the broker.
//! - **order** — the order model and the controller actor owning it.
//! - **exchange** — the step-locked state machine, its messages, and
//!   the runner actor that drives one swap.
//! - **funds** — the blocker reserving both legs before an order goes
//!   live.
//! - **submission** — the keep-alive supervisor holding entries in the
//!   broker's book.
//! - **peer** — the engine wiring one participant together.
//! - **wallet** / **payment** — contracts with the external bitcoin
//!   wallet and fiat processor, with deterministic in-memory doubles.
//! - **money**, **ids**, **crypto**, **config** — the shared vocabulary.
//!
//! ## Design Philosophy
//!
//! 1. One actor, one mailbox, one message at a time. No shared state.
//! 2. The overlay is allowed to lose messages; the protocol is not
//!    allowed to care — everything retransmits idempotently.
//! 3. Anything that touches money is checked arithmetic with explicit
//!    rounding, and it has tests.

pub mod broker;
pub mod config;
pub mod crypto;
pub mod exchange;
pub mod funds;
pub mod ids;
pub mod money;
pub mod order;
pub mod payment;
pub mod peer;
pub mod relay;
pub mod submission;
pub mod wallet;
