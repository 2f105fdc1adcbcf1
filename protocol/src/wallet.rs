//! # Wallet contract
//!
//! The bitcoin wallet is an external collaborator: UTXO selection,
//! transaction construction, signing and broadcast all live outside this
//! crate. What lives here is the [`Wallet`] trait the engine programs
//! against, the minimal transaction vocabulary the exchange protocol
//! needs, and a deterministic [`InMemoryWallet`] used by every test.
//!
//! The trait is async because a production implementation fronts an
//! actor that talks to the bitcoin network; no engine actor ever blocks
//! on wallet I/O inside a message handler.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::crypto::{TradeKeypair, TradePublicKey, TradeSignature};
use crate::ids::{ExchangeId, OverlayId};
use crate::money::BitcoinAmount;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the wallet. All of them end the affected exchange;
/// none of them are fatal to the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    /// The reservation exceeded the spendable balance.
    #[error("not enough funds: requested {requested}, available {available}")]
    NotEnoughFunds {
        /// Amount that was requested.
        requested: BitcoinAmount,
        /// Spendable balance at the time of the request.
        available: BitcoinAmount,
    },

    /// A transaction hash the wallet has never seen.
    #[error("unknown transaction: {0}")]
    UnknownTransaction(TxHash),

    /// The on-chain transfer failed (rejected by the network).
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// A broadcast was rejected (missing signatures, spent inputs).
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
}

// ---------------------------------------------------------------------------
// Transaction vocabulary
// ---------------------------------------------------------------------------

/// Hash identifying a broadcast transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash([u8; 32]);

impl TxHash {
    /// Computes the hash of a transaction template.
    pub fn of(template: &TransactionTemplate) -> Self {
        let bytes = bincode::serialize(template).expect("template serialization is infallible");
        Self(*blake3::hash(&bytes).as_bytes())
    }

    /// Hex rendering, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self.to_hex())
    }
}

/// Handle to a standing reservation of spendable funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reservation:{}", self.0)
    }
}

/// What a trade transaction *is*, before any signature is attached.
///
/// The engine never constructs raw bitcoin scripts; it describes the
/// transaction it needs and lets the wallet realize it. The template is
/// also the byte string that gets signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTemplate {
    /// Role of the transaction in the exchange protocol.
    pub kind: TxKind,
    /// Output value in satoshi.
    pub amount: BitcoinAmount,
    /// Block-height delta after which the refund path unlocks. `None`
    /// for transactions without a time-locked clause.
    pub lock_time: Option<u32>,
}

/// The three transaction roles of the step-locked protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Collateral deposit, spendable only jointly, refundable after the
    /// time-lock.
    Deposit {
        /// Exchange this deposit collateralizes.
        exchange_id: ExchangeId,
        /// Peer that funded it.
        depositor: OverlayId,
    },
    /// Release of step `step`'s share of a deposit to the counterpart.
    StepRelease {
        /// Exchange the release belongs to.
        exchange_id: ExchangeId,
        /// 1-based step index.
        step: u32,
        /// Peer whose deposit is being unlocked.
        depositor: OverlayId,
    },
    /// Time-locked refund of the remainder of a deposit.
    Refund {
        /// Exchange being unwound.
        exchange_id: ExchangeId,
        /// Peer reclaiming its deposit.
        depositor: OverlayId,
    },
}

/// A transaction template carrying one party's signature. The other
/// party co-signs to make it broadcastable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPartial {
    /// The transaction being signed.
    pub template: TransactionTemplate,
    /// Signer's public key.
    pub signer: TradePublicKey,
    /// Signature over the serialized template.
    pub signature: TradeSignature,
}

impl SignedPartial {
    /// Verifies the embedded signature against the embedded key.
    pub fn verify(&self) -> bool {
        let bytes =
            bincode::serialize(&self.template).expect("template serialization is infallible");
        self.signer.verify(&bytes, &self.signature)
    }

    /// Hash of the underlying transaction.
    pub fn tx_hash(&self) -> TxHash {
        TxHash::of(&self.template)
    }
}

// ---------------------------------------------------------------------------
// Wallet trait
// ---------------------------------------------------------------------------

/// The engine's contract with the bitcoin wallet.
///
/// Process-wide singleton, shared as `Arc<dyn Wallet>`. Reservations
/// guarantee that two orders never commit the same funds; `confirmations`
/// backs the deposit confirmation policy of the exchange handshake.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Creates a fresh signing keypair for one exchange.
    async fn create_key_pair(&self) -> TradeKeypair;

    /// Reserves `amount` out of the spendable balance.
    async fn reserve(&self, amount: BitcoinAmount) -> Result<ReservationId, WalletError>;

    /// Releases a reservation. Idempotent: releasing an unknown or
    /// already-released reservation is a no-op.
    async fn release(&self, reservation: ReservationId);

    /// Signs a transaction template with the given key.
    async fn sign_partial(&self, template: &TransactionTemplate, key: &TradeKeypair)
        -> SignedPartial;

    /// Broadcasts a fully co-signed transaction to the network.
    async fn broadcast(&self, partial: &SignedPartial) -> Result<TxHash, WalletError>;

    /// Number of confirmations a broadcast transaction has accumulated.
    async fn confirmations(&self, tx: &TxHash) -> Result<u32, WalletError>;

    /// Plain transfer to an arbitrary destination, outside any exchange.
    async fn transfer(&self, amount: BitcoinAmount, destination: OverlayId)
        -> Result<TxHash, WalletError>;

    /// Currently spendable balance (total minus reservations).
    async fn available(&self) -> BitcoinAmount;
}

// ---------------------------------------------------------------------------
// In-memory wallet
// ---------------------------------------------------------------------------

struct WalletState {
    available: BitcoinAmount,
    reservations: HashMap<ReservationId, BitcoinAmount>,
    broadcast: HashMap<TxHash, u32>,
}

/// Deterministic wallet double used throughout the tests.
///
/// Holds a fixed balance, confirms every broadcast instantly with
/// [`instant_confirmations`](Self::instant_confirmations) confirmations,
/// and lets a test revoke a live reservation to simulate a re-org — the
/// revocation is pushed down the channel handed out by
/// [`revocations`](Self::revocations).
pub struct InMemoryWallet {
    state: Mutex<WalletState>,
    instant_confirmations: u32,
    revocation_tx: Mutex<Option<mpsc::UnboundedSender<ReservationId>>>,
}

impl InMemoryWallet {
    /// Creates a wallet with the given spendable balance.
    pub fn new(balance: BitcoinAmount) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WalletState {
                available: balance,
                reservations: HashMap::new(),
                broadcast: HashMap::new(),
            }),
            instant_confirmations: crate::config::DEPOSIT_CONFIRMATIONS,
            revocation_tx: Mutex::new(None),
        })
    }

    /// Takes the revocation stream. Call at most once, before spawning
    /// the funds blocker that should observe revocations.
    pub fn revocations(&self) -> mpsc::UnboundedReceiver<ReservationId> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.revocation_tx.lock() = Some(tx);
        rx
    }

    /// Simulates a re-org invalidating a reservation: the reserved funds
    /// vanish and the revocation is announced on the stream.
    pub fn revoke(&self, reservation: ReservationId) {
        let removed = self.state.lock().reservations.remove(&reservation);
        if removed.is_some() {
            if let Some(tx) = self.revocation_tx.lock().as_ref() {
                let _ = tx.send(reservation);
            }
        }
    }
}

#[async_trait]
impl Wallet for InMemoryWallet {
    async fn create_key_pair(&self) -> TradeKeypair {
        TradeKeypair::generate()
    }

    async fn reserve(&self, amount: BitcoinAmount) -> Result<ReservationId, WalletError> {
        let mut state = self.state.lock();
        if amount > state.available {
            return Err(WalletError::NotEnoughFunds {
                requested: amount,
                available: state.available,
            });
        }
        state.available = state
            .available
            .checked_sub(amount)
            .expect("checked against available above");
        let id = ReservationId::random();
        state.reservations.insert(id, amount);
        Ok(id)
    }

    async fn release(&self, reservation: ReservationId) {
        let mut state = self.state.lock();
        if let Some(amount) = state.reservations.remove(&reservation) {
            state.available = state
                .available
                .checked_add(amount)
                .expect("releasing cannot exceed the original balance");
        }
    }

    async fn sign_partial(
        &self,
        template: &TransactionTemplate,
        key: &TradeKeypair,
    ) -> SignedPartial {
        let bytes = bincode::serialize(template).expect("template serialization is infallible");
        SignedPartial {
            template: template.clone(),
            signer: key.public_key(),
            signature: key.sign(&bytes),
        }
    }

    async fn broadcast(&self, partial: &SignedPartial) -> Result<TxHash, WalletError> {
        if !partial.verify() {
            return Err(WalletError::BroadcastRejected(
                "invalid signature on partial".to_string(),
            ));
        }
        let mut state = self.state.lock();
        // Funding a deposit spends the wallet; a refund returns to it.
        // Step releases move value inside the deposit, not the wallet.
        match &partial.template.kind {
            TxKind::Deposit { .. } => {
                state.available =
                    state
                        .available
                        .checked_sub(partial.template.amount)
                        .map_err(|_| {
                            WalletError::BroadcastRejected(
                                "deposit exceeds spendable balance".to_string(),
                            )
                        })?;
            }
            TxKind::Refund { .. } => {
                state.available = state
                    .available
                    .checked_add(partial.template.amount)
                    .map_err(|_| {
                        WalletError::BroadcastRejected("refund overflows balance".to_string())
                    })?;
            }
            TxKind::StepRelease { .. } => {}
        }
        let hash = partial.tx_hash();
        state.broadcast.insert(hash, self.instant_confirmations);
        Ok(hash)
    }

    async fn confirmations(&self, tx: &TxHash) -> Result<u32, WalletError> {
        self.state
            .lock()
            .broadcast
            .get(tx)
            .copied()
            .ok_or(WalletError::UnknownTransaction(*tx))
    }

    async fn transfer(
        &self,
        amount: BitcoinAmount,
        destination: OverlayId,
    ) -> Result<TxHash, WalletError> {
        let mut state = self.state.lock();
        if amount > state.available {
            return Err(WalletError::TransferFailed(format!(
                "insufficient funds for transfer to {destination}"
            )));
        }
        state.available = state
            .available
            .checked_sub(amount)
            .expect("checked against available above");
        let template = TransactionTemplate {
            kind: TxKind::Refund {
                exchange_id: ExchangeId::random(),
                depositor: destination,
            },
            amount,
            lock_time: None,
        };
        let hash = TxHash::of(&template);
        state.broadcast.insert(hash, self.instant_confirmations);
        Ok(hash)
    }

    async fn available(&self) -> BitcoinAmount {
        self.state.lock().available
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
