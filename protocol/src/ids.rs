//! # Identifiers
//!
//! Opaque identifiers used across the engine: [`OrderId`] and
//! [`ExchangeId`] are UUIDv4 newtypes, [`OverlayId`] is the 20-byte
//! address a participant answers to on the relay overlay.
//!
//! A peer's overlay id is derived from its long-term public key by
//! hashing and truncating; the broker answers to the well-known
//! [`BROKER_ID`] baked into every client.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::crypto::TradePublicKey;

/// Length of an overlay endpoint id in bytes.
pub const OVERLAY_ID_LENGTH: usize = 20;

/// The broker's well-known overlay id. Every peer addresses order-book
/// traffic to this endpoint; the broker's relay server joins under it.
pub const BROKER_ID: OverlayId = OverlayId([
    0x5b, 0x72, 0x6f, 0x6b, 0x65, 0x72, 0x2e, 0x73, 0x74, 0x65, 0x70, 0x73, 0x77, 0x61, 0x70,
    0x5d, 0x00, 0x00, 0x00, 0x01,
]);

// ---------------------------------------------------------------------------
// OrderId / ExchangeId
// ---------------------------------------------------------------------------

/// Globally unique identity of an order. Assigned once at creation and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Generates a fresh random order id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "order:{}", self.0)
    }
}

/// Globally unique identity of one matched exchange. Issued by the broker
/// inside an `OrderMatch`; a peer never invents one locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    /// Generates a fresh random exchange id (broker side and tests).
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// OverlayId
// ---------------------------------------------------------------------------

/// A 20-byte relay endpoint address.
///
/// The relay server routes frames purely by this tag; it carries no
/// routable network information itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlayId([u8; OVERLAY_ID_LENGTH]);

impl OverlayId {
    /// Wraps raw bytes as an overlay id.
    pub fn from_bytes(bytes: [u8; OVERLAY_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derives the overlay id of a peer from its public key: the first
    /// 20 bytes of the BLAKE3 digest of the key bytes.
    pub fn from_public_key(key: &TradePublicKey) -> Self {
        let digest = blake3::hash(key.as_bytes());
        let mut bytes = [0u8; OVERLAY_ID_LENGTH];
        bytes.copy_from_slice(&digest.as_bytes()[..OVERLAY_ID_LENGTH]);
        Self(bytes)
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let decoded = hex::decode(s)?;
        if decoded.len() != OVERLAY_ID_LENGTH {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut bytes = [0u8; OVERLAY_ID_LENGTH];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; OVERLAY_ID_LENGTH] {
        &self.0
    }

    /// Hex rendering, 40 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns `true` if this is the broker's well-known id.
    pub fn is_broker(&self) -> bool {
        *self == BROKER_ID
    }
}

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hex is unwieldy in logs; eight leading chars identify a
        // peer well enough for operators.
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Debug for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayId({})", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TradeKeypair;

    #[test]
    fn order_ids_are_unique() {
        assert_ne!(OrderId::random(), OrderId::random());
    }

    #[test]
    fn overlay_id_hex_roundtrip() {
        let kp = TradeKeypair::generate();
        let id = OverlayId::from_public_key(&kp.public_key());
        let recovered = OverlayId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn overlay_id_rejects_wrong_length_hex() {
        assert!(OverlayId::from_hex("deadbeef").is_err());
    }

    #[test]
    fn overlay_id_is_deterministic_per_key() {
        let kp = TradeKeypair::generate();
        let a = OverlayId::from_public_key(&kp.public_key());
        let b = OverlayId::from_public_key(&kp.public_key());
        assert_eq!(a, b);
    }

    #[test]
    fn broker_id_is_recognized() {
        assert!(BROKER_ID.is_broker());
        let kp = TradeKeypair::generate();
        assert!(!OverlayId::from_public_key(&kp.public_key()).is_broker());
    }

    #[test]
    fn overlay_id_serde_roundtrip() {
        let id = BROKER_ID;
        let encoded = bincode::serialize(&id).unwrap();
        let decoded: OverlayId = bincode::deserialize(&encoded).unwrap();
        assert_eq!(id, decoded);
    }
}
