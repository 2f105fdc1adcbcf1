//! # Signing keys
//!
//! Ed25519 keypair generation and signatures for trade material: deposit
//! transactions, step releases, and the overlay identity. Every exchange
//! uses a *fresh* keypair created by the wallet for that exchange alone,
//! so compromise of one trade's key never touches another.
//!
//! Private keys are generated from the OS RNG and never serialized
//! implicitly — exporting secret bytes is an explicit call.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during key operations. Deliberately vague about
/// the *why* — error messages must not leak key material details.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Secret key bytes had the wrong length or were not a valid scalar.
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    /// Public key bytes were not a valid Ed25519 point.
    #[error("invalid public key bytes")]
    InvalidPublicKey,
}

// ---------------------------------------------------------------------------
// TradeKeypair
// ---------------------------------------------------------------------------

/// A signing keypair for trade material.
///
/// Does not implement `Serialize`/`Deserialize`: persisting a private key
/// is a deliberate act done through [`secret_key_bytes`](Self::secret_key_bytes).
pub struct TradeKeypair {
    signing_key: SigningKey,
}

impl TradeKeypair {
    /// Generates a fresh keypair from the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstructs a keypair deterministically from a 32-byte seed.
    /// In Ed25519 the secret key *is* the seed.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstructs a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> TradePublicKey {
        TradePublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> TradeSignature {
        TradeSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }

    /// Exports the raw 32-byte secret key material. Handle with care.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }
}

impl Clone for TradeKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for TradeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret key material, not even partially.
        write!(f, "TradeKeypair(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// TradePublicKey
// ---------------------------------------------------------------------------

/// The shareable half of a trade identity.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradePublicKey {
    bytes: [u8; 32],
}

impl TradePublicKey {
    /// Validates and wraps a 32-byte slice as a public key. Rejects
    /// byte strings that are not valid Ed25519 points.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Verifies a signature over `message`. Returns a plain boolean:
    /// callers want yes/no, not the failure taxonomy.
    pub fn verify(&self, message: &[u8], signature: &TradeSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let sig_bytes: [u8; 64] = match signature.bytes.as_slice().try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        verifying_key
            .verify(message, &DalekSignature::from_bytes(&sig_bytes))
            .is_ok()
    }

    /// Hex rendering, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for TradePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TradePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TradePublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// TradeSignature
// ---------------------------------------------------------------------------

/// An Ed25519 signature over trade material. Always 64 bytes when
/// produced by [`TradeKeypair::sign`]; anything else simply fails
/// verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSignature {
    bytes: Vec<u8>,
}

impl TradeSignature {
    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Debug for TradeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        if hex_str.len() >= 128 {
            write!(f, "TradeSignature({}...)", &hex_str[..8])
        } else {
            write!(f, "TradeSignature({})", hex_str)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
