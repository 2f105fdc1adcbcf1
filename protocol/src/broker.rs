//! # Broker protocol
//!
//! The handful of messages a peer exchanges with the broker over the
//! relay, addressed to [`BROKER_ID`](crate::ids::BROKER_ID): publishing
//! an order-book entry, receiving a match, and rejecting one. The broker
//! is trusted to match orders and for nothing else — none of these
//! messages ever move funds.
//!
//! Inbound relay payloads are dispatched by their verified source: only
//! frames from the broker's id are decoded with this schema.

use serde::{Deserialize, Serialize};

use crate::ids::{ExchangeId, OrderId, OverlayId};
use crate::money::{BitcoinAmount, FiatAmount};
use crate::order::Side;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Canonical order representation published to the broker's book. The
/// currency is implied by `price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookEntry {
    /// Order being published.
    pub order_id: OrderId,
    /// Bid (buy bitcoin) or ask (sell bitcoin).
    pub side: Side,
    /// Remaining amount still to be traded.
    pub amount: BitcoinAmount,
    /// Limit price in fiat per whole BTC.
    pub price: FiatAmount,
}

/// The broker matched part (or all) of an order against a counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMatch {
    /// The local order the match is for.
    pub order_id: OrderId,
    /// Broker-issued id of the new exchange.
    pub exchange_id: ExchangeId,
    /// Overlay id of the matched counterpart.
    pub counterpart_id: OverlayId,
    /// Bitcoin amount of the exchange.
    pub bitcoin_amount: BitcoinAmount,
    /// Fiat amount of the exchange.
    pub fiat_amount: FiatAmount,
}

/// A peer declined a match (or aborted its handshake).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRejection {
    /// The exchange being rejected.
    pub exchange_id: ExchangeId,
    /// Human-readable cause, forwarded to the counterpart by the broker.
    pub cause: String,
}

/// Envelope for everything flowing between a peer and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerMessage {
    /// Peer → broker: keep this entry in the book.
    Entry(OrderBookEntry),
    /// Broker → peer: you have been matched.
    Match(OrderMatch),
    /// Peer → broker: the match is off.
    Rejection(ExchangeRejection),
}

impl BrokerMessage {
    /// Serializes for a relay payload.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("broker message serialization is infallible")
    }

    /// Deserializes a relay payload received from the broker.
    pub fn decode(payload: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(payload)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BROKER_ID;
    use crate::money::Currency;

    #[test]
    fn entry_roundtrip() {
        let message = BrokerMessage::Entry(OrderBookEntry {
            order_id: OrderId::random(),
            side: Side::Bid,
            amount: BitcoinAmount::from_btc(10),
            price: FiatAmount::from_major(10, Currency::Eur),
        });
        assert_eq!(
            BrokerMessage::decode(&message.encode()).unwrap(),
            message
        );
    }

    #[test]
    fn match_roundtrip() {
        let message = BrokerMessage::Match(OrderMatch {
            order_id: OrderId::random(),
            exchange_id: ExchangeId::random(),
            counterpart_id: BROKER_ID,
            bitcoin_amount: BitcoinAmount::from_sat(5_000_000),
            fiat_amount: FiatAmount::new(12_345, Currency::Usd),
        });
        assert_eq!(
            BrokerMessage::decode(&message.encode()).unwrap(),
            message
        );
    }

    #[test]
    fn rejection_roundtrip() {
        let message = BrokerMessage::Rejection(ExchangeRejection {
            exchange_id: ExchangeId::random(),
            cause: "MatchExceedsPending".to_string(),
        });
        assert_eq!(
            BrokerMessage::decode(&message.encode()).unwrap(),
            message
        );
    }

    #[test]
    fn garbage_payload_rejected() {
        assert!(BrokerMessage::decode(b"\xff\xff\xff\xff").is_err());
    }
}
