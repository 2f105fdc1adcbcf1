//! # Trade messages
//!
//! Peer-to-peer messages of the step-locked protocol, carried as relay
//! payloads between the two matched counterparts. Every step message is
//! keyed by `(exchange_id, step)`: receivers treat an already-processed
//! key as a duplicate, acknowledge it and drop it, which is what makes
//! blind retransmission over the lossy overlay safe.

use serde::{Deserialize, Serialize};

use super::machine::PeerInfo;
use crate::ids::ExchangeId;
use crate::payment::PaymentReceipt;
use crate::wallet::{SignedPartial, TxHash};

/// A message between the two parties of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMessage {
    /// Handshake announcement: payment account and fresh public key.
    /// Retransmitted until the counterpart's own announcement arrives.
    Handshake {
        /// Exchange this belongs to.
        exchange_id: ExchangeId,
        /// The sender's announced info.
        info: PeerInfo,
    },

    /// The sender funded and broadcast its deposit.
    DepositProof {
        /// Exchange this belongs to.
        exchange_id: ExchangeId,
        /// The deposit transaction, carrying the sender's signature.
        partial: SignedPartial,
        /// Hash under which it was broadcast.
        tx_hash: TxHash,
    },

    /// Buyer → seller: fiat for step `step` has been paid; here is the
    /// signed partial releasing this step's share of the seller deposit.
    StepRelease {
        /// Exchange this belongs to.
        exchange_id: ExchangeId,
        /// 1-based step index.
        step: u32,
        /// Buyer-signed release of the seller's deposit share.
        partial: SignedPartial,
        /// The fiat payment receipt, for correlation only — the seller
        /// verifies the credit with its own processor, never from this.
        receipt: PaymentReceipt,
    },

    /// Seller → buyer: step `step` is committed on-chain; here is the
    /// release of the buyer's own deposit share in return.
    StepComplete {
        /// Exchange this belongs to.
        exchange_id: ExchangeId,
        /// 1-based step index.
        step: u32,
        /// Seller-signed release of the buyer's deposit share.
        partial: SignedPartial,
    },

    /// Duplicate acknowledgement for an already-processed step message.
    StepAck {
        /// Exchange this belongs to.
        exchange_id: ExchangeId,
        /// The step that had already been processed.
        step: u32,
    },

    /// The sender is walking away at a step boundary.
    Abort {
        /// Exchange this belongs to.
        exchange_id: ExchangeId,
        /// Why.
        reason: String,
    },
}

impl TradeMessage {
    /// The exchange a message belongs to, used for routing to the
    /// owning runner.
    pub fn exchange_id(&self) -> ExchangeId {
        match self {
            Self::Handshake { exchange_id, .. }
            | Self::DepositProof { exchange_id, .. }
            | Self::StepRelease { exchange_id, .. }
            | Self::StepComplete { exchange_id, .. }
            | Self::StepAck { exchange_id, .. }
            | Self::Abort { exchange_id, .. } => *exchange_id,
        }
    }

    /// Serializes for a relay payload.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("trade message serialization is infallible")
    }

    /// Deserializes a relay payload received from a peer.
    pub fn decode(payload: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(payload)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
