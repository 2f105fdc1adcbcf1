//! # Payment processor contract
//!
//! The fiat side of a trade runs through an external payment processor
//! (bank transfer rails, an e-money API — whatever the operator wired
//! up). The engine sees it through the [`PaymentProcessor`] trait: it can
//! pay a step, verify that a step's credit arrived, and reserve fiat so
//! an order never promises money it does not have.
//!
//! [`InMemoryPaymentHub`] is the test double: a tiny clearing house that
//! hosts any number of accounts and settles payments instantly, so two
//! in-process peers can observe each other's micro-payments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::money::{Currency, FiatAmount};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the payment processor. They fail the affected
/// exchange or reservation, never the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    /// The account cannot cover the requested amount.
    #[error("insufficient fiat funds: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Amount that was requested.
        requested: FiatAmount,
        /// Available balance at the time of the request.
        available: FiatAmount,
    },

    /// The destination account does not exist at this processor.
    #[error("unknown payment account: {0}")]
    UnknownAccount(AccountId),

    /// The processor rejected the operation for its own reasons.
    #[error("payment processor rejected the operation: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Account identifier at the payment processor. Opaque to the engine;
/// exchanged during the handshake so each side knows where to send fiat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Wraps a processor-issued account name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw account string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a standing fiat reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiatReservationId(Uuid);

impl FiatReservationId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Proof that a micro-payment was executed. Returned by
/// [`PaymentProcessor::pay`] and forwarded to the counterpart alongside
/// the step release so it can correlate the credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    /// Processor-issued payment identifier.
    pub payment_id: String,
    /// 1-based step index this payment settles.
    pub step: u32,
    /// Paid amount.
    pub amount: FiatAmount,
    /// Paying account.
    pub from: AccountId,
    /// Receiving account.
    pub to: AccountId,
    /// Settlement timestamp at the processor.
    pub executed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PaymentProcessor trait
// ---------------------------------------------------------------------------

/// The engine's contract with the fiat payment processor.
///
/// Process-wide singleton, shared as `Arc<dyn PaymentProcessor>`.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// The local account id, announced to counterparts in the handshake.
    async fn retrieve_account_id(&self) -> AccountId;

    /// Executes micro-payment `step` of `amount` to `destination`.
    async fn pay(
        &self,
        step: u32,
        amount: FiatAmount,
        destination: &AccountId,
    ) -> Result<PaymentReceipt, PaymentError>;

    /// Returns `true` if a credit of exactly `expected` has arrived on
    /// the local account since `since`.
    async fn verify_credit(
        &self,
        expected: FiatAmount,
        since: DateTime<Utc>,
    ) -> Result<bool, PaymentError>;

    /// Reserves `amount` so it cannot be spent elsewhere.
    async fn reserve(&self, amount: FiatAmount) -> Result<FiatReservationId, PaymentError>;

    /// Releases a reservation. Idempotent.
    async fn release(&self, reservation: FiatReservationId);

    /// Available (unreserved) balance in `currency`.
    async fn available(&self, currency: Currency) -> FiatAmount;
}

// ---------------------------------------------------------------------------
// In-memory clearing house
// ---------------------------------------------------------------------------

struct Credit {
    amount: FiatAmount,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct AccountState {
    available: HashMap<Currency, u64>,
    reservations: HashMap<FiatReservationId, FiatAmount>,
    credits: Vec<Credit>,
}

/// Shared in-memory clearing house for the test doubles. All accounts
/// opened on the same hub settle against each other instantly.
#[derive(Default)]
pub struct InMemoryPaymentHub {
    accounts: Mutex<HashMap<AccountId, AccountState>>,
    payment_seq: Mutex<u64>,
}

impl InMemoryPaymentHub {
    /// Creates an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens an account with an initial balance and returns a processor
    /// client bound to it.
    pub fn open_account(
        self: &Arc<Self>,
        name: &str,
        balance: FiatAmount,
    ) -> Arc<InMemoryPaymentProcessor> {
        let account = AccountId::new(name);
        let mut state = AccountState::default();
        state
            .available
            .insert(balance.currency(), balance.units());
        self.accounts.lock().insert(account.clone(), state);
        Arc::new(InMemoryPaymentProcessor {
            hub: Arc::clone(self),
            account,
        })
    }

    fn next_payment_id(&self) -> String {
        let mut seq = self.payment_seq.lock();
        *seq += 1;
        format!("pay-{:06}", *seq)
    }
}

/// A processor client bound to one account of an [`InMemoryPaymentHub`].
pub struct InMemoryPaymentProcessor {
    hub: Arc<InMemoryPaymentHub>,
    account: AccountId,
}

#[async_trait]
impl PaymentProcessor for InMemoryPaymentProcessor {
    async fn retrieve_account_id(&self) -> AccountId {
        self.account.clone()
    }

    async fn pay(
        &self,
        step: u32,
        amount: FiatAmount,
        destination: &AccountId,
    ) -> Result<PaymentReceipt, PaymentError> {
        let mut accounts = self.hub.accounts.lock();
        if !accounts.contains_key(destination) {
            return Err(PaymentError::UnknownAccount(destination.clone()));
        }

        let payer = accounts
            .get_mut(&self.account)
            .ok_or_else(|| PaymentError::UnknownAccount(self.account.clone()))?;
        let available = payer
            .available
            .get(&amount.currency())
            .copied()
            .unwrap_or(0);
        if available < amount.units() {
            return Err(PaymentError::InsufficientFunds {
                requested: amount,
                available: FiatAmount::new(available, amount.currency()),
            });
        }
        payer
            .available
            .insert(amount.currency(), available - amount.units());

        let executed_at = Utc::now();
        let payee = accounts
            .get_mut(destination)
            .expect("destination checked above");
        *payee.available.entry(amount.currency()).or_insert(0) += amount.units();
        payee.credits.push(Credit {
            amount,
            at: executed_at,
        });

        Ok(PaymentReceipt {
            payment_id: self.hub.next_payment_id(),
            step,
            amount,
            from: self.account.clone(),
            to: destination.clone(),
            executed_at,
        })
    }

    async fn verify_credit(
        &self,
        expected: FiatAmount,
        since: DateTime<Utc>,
    ) -> Result<bool, PaymentError> {
        let accounts = self.hub.accounts.lock();
        let state = accounts
            .get(&self.account)
            .ok_or_else(|| PaymentError::UnknownAccount(self.account.clone()))?;
        Ok(state
            .credits
            .iter()
            .any(|c| c.amount == expected && c.at >= since))
    }

    async fn reserve(&self, amount: FiatAmount) -> Result<FiatReservationId, PaymentError> {
        let mut accounts = self.hub.accounts.lock();
        let state = accounts
            .get_mut(&self.account)
            .ok_or_else(|| PaymentError::UnknownAccount(self.account.clone()))?;
        let available = state
            .available
            .get(&amount.currency())
            .copied()
            .unwrap_or(0);
        if available < amount.units() {
            return Err(PaymentError::InsufficientFunds {
                requested: amount,
                available: FiatAmount::new(available, amount.currency()),
            });
        }
        state
            .available
            .insert(amount.currency(), available - amount.units());
        let id = FiatReservationId::random();
        state.reservations.insert(id, amount);
        Ok(id)
    }

    async fn release(&self, reservation: FiatReservationId) {
        let mut accounts = self.hub.accounts.lock();
        if let Some(state) = accounts.get_mut(&self.account) {
            if let Some(amount) = state.reservations.remove(&reservation) {
                *state.available.entry(amount.currency()).or_insert(0) += amount.units();
            }
        }
    }

    async fn available(&self, currency: Currency) -> FiatAmount {
        let accounts = self.hub.accounts.lock();
        let units = accounts
            .get(&self.account)
            .and_then(|s| s.available.get(&currency).copied())
            .unwrap_or(0);
        FiatAmount::new(units, currency)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn eur(units: u64) -> FiatAmount {
        FiatAmount::new(units, Currency::Eur)
    }

    #[tokio::test]
    async fn pay_settles_and_credit_is_verifiable() {
        let hub = InMemoryPaymentHub::new();
        let buyer = hub.open_account("buyer", eur(10_000));
        let seller = hub.open_account("seller", eur(0));
        let since = Utc::now();

        let receipt = buyer
            .pay(1, eur(1_000), &seller.retrieve_account_id().await)
            .await
            .unwrap();
        assert_eq!(receipt.step, 1);
        assert_eq!(receipt.amount, eur(1_000));

        assert!(seller.verify_credit(eur(1_000), since).await.unwrap());
        assert!(!seller.verify_credit(eur(999), since).await.unwrap());
        assert_eq!(buyer.available(Currency::Eur).await, eur(9_000));
        assert_eq!(seller.available(Currency::Eur).await, eur(1_000));
    }

    #[tokio::test]
    async fn pay_rejects_overdraft() {
        let hub = InMemoryPaymentHub::new();
        let buyer = hub.open_account("buyer", eur(100));
        let seller = hub.open_account("seller", eur(0));

        let err = buyer
            .pay(1, eur(200), &seller.retrieve_account_id().await)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InsufficientFunds { .. }));
        // Nothing moved.
        assert_eq!(buyer.available(Currency::Eur).await, eur(100));
    }

    #[tokio::test]
    async fn pay_to_unknown_account_rejected() {
        let hub = InMemoryPaymentHub::new();
        let buyer = hub.open_account("buyer", eur(100));
        let err = buyer
            .pay(1, eur(50), &AccountId::new("nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnknownAccount(_)));
    }

    #[tokio::test]
    async fn reserve_then_release_restores_balance() {
        let hub = InMemoryPaymentHub::new();
        let account = hub.open_account("trader", eur(5_000));

        let reservation = account.reserve(eur(2_000)).await.unwrap();
        assert_eq!(account.available(Currency::Eur).await, eur(3_000));

        account.release(reservation).await;
        account.release(reservation).await; // idempotent
        assert_eq!(account.available(Currency::Eur).await, eur(5_000));
    }

    #[tokio::test]
    async fn credits_before_since_are_ignored() {
        let hub = InMemoryPaymentHub::new();
        let buyer = hub.open_account("buyer", eur(1_000));
        let seller = hub.open_account("seller", eur(0));

        buyer
            .pay(1, eur(100), &seller.retrieve_account_id().await)
            .await
            .unwrap();
        let after_payment = Utc::now() + chrono::Duration::seconds(1);
        assert!(!seller.verify_credit(eur(100), after_payment).await.unwrap());
    }
}
