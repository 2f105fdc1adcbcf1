//! # Exchange state machine
//!
//! The pure core of one exchange. It owns the phase, the peer info
//! learned during the handshake, the funded deposits and the step
//! counter — and nothing else. All I/O lives in the
//! [`runner`](super::runner).
//!
//! Transitions are **total**: an input that is not valid in the current
//! phase comes back as an [`InvalidTransition`] value for the caller to
//! log and drop. The machine never panics on hostile input, terminal
//! phases are immutable, and `steps_completed` never decreases.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::crypto::TradePublicKey;
use crate::ids::{ExchangeId, OverlayId};
use crate::money::{BitcoinAmount, FiatAmount};
use crate::payment::AccountId;
use crate::wallet::TxHash;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Which side of the trade this peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeRole {
    /// Pays fiat, receives bitcoin.
    Buyer,
    /// Receives fiat, releases bitcoin.
    Seller,
}

impl ExchangeRole {
    /// The counterpart's role.
    pub fn counterpart(&self) -> Self {
        match self {
            Self::Buyer => Self::Seller,
            Self::Seller => Self::Buyer,
        }
    }
}

impl fmt::Display for ExchangeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buyer => f.write_str("buyer"),
            Self::Seller => f.write_str("seller"),
        }
    }
}

/// What a peer announces about itself during the handshake: where to
/// send fiat, and the fresh public key its trade signatures verify under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Payment processor account of the peer.
    pub account_id: AccountId,
    /// Fresh per-exchange signing key.
    pub public_key: TradePublicKey,
}

/// The two funded collateral deposits, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposits {
    /// The buyer's broadcast deposit.
    pub buyer: TxHash,
    /// The seller's broadcast deposit.
    pub seller: TxHash,
}

/// Parameters fixed when the broker issues the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeParams {
    /// Broker-issued exchange id.
    pub exchange_id: ExchangeId,
    /// This peer's role.
    pub role: ExchangeRole,
    /// Number of micro-payment steps, `>= 1`.
    pub step_count: u32,
    /// Total bitcoin amount of the exchange.
    pub bitcoin_amount: BitcoinAmount,
    /// Total fiat amount of the exchange.
    pub fiat_amount: FiatAmount,
    /// Overlay id of the counterpart.
    pub counterpart: OverlayId,
}

/// Phase of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangePhase {
    /// Created, not yet announced to the counterpart.
    NonStarted,
    /// Exchanging peer info and funding deposits.
    Handshaking,
    /// Working through the step loop.
    Exchanging {
        /// Steps committed so far, `0..=step_count`.
        steps_completed: u32,
    },
    /// Terminal: all `N` steps committed.
    Successful,
    /// Terminal: handshake abandoned before funds were at risk.
    Aborted {
        /// Why the handshake was abandoned.
        cause: String,
    },
    /// Terminal: the exchange died mid-flight; refunds are in motion.
    Failed {
        /// Why the exchange failed.
        cause: String,
    },
}

impl ExchangePhase {
    /// Short phase name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NonStarted => "non-started",
            Self::Handshaking => "handshaking",
            Self::Exchanging { .. } => "exchanging",
            Self::Successful => "successful",
            Self::Aborted { .. } => "aborted",
            Self::Failed { .. } => "failed",
        }
    }

    /// Terminal phases accept no further input.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Aborted { .. } | Self::Failed { .. }
        )
    }
}

/// Result of feeding a step completion into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step committed; more remain.
    Advanced(u32),
    /// The final step committed; the exchange is successful.
    Completed,
    /// The step had already been committed. Acknowledge and drop —
    /// this is what makes retransmission idempotent.
    Duplicate,
}

/// An input arrived in a phase where it means nothing. Logged and
/// dropped by the caller; never escalated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("input `{input}` not valid in phase `{phase}`")]
pub struct InvalidTransition {
    /// Phase the machine was in.
    pub phase: &'static str,
    /// The input that was dropped.
    pub input: &'static str,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable view of an exchange at a point in time. This is what the
/// order controller stores and derives its amounts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    /// Exchange identity.
    pub exchange_id: ExchangeId,
    /// This peer's role.
    pub role: ExchangeRole,
    /// Counterpart overlay id.
    pub counterpart: OverlayId,
    /// Total bitcoin amount.
    pub bitcoin_amount: BitcoinAmount,
    /// Total fiat amount.
    pub fiat_amount: FiatAmount,
    /// Number of steps.
    pub step_count: u32,
    /// Steps committed so far.
    pub steps_completed: u32,
    /// Current phase.
    pub phase: ExchangePhase,
}

impl ExchangeSnapshot {
    /// Not yet terminal: the exchange still occupies its slice of the
    /// order's amount.
    pub fn is_running(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// Terminal and fully exchanged.
    pub fn is_successful(&self) -> bool {
        matches!(self.phase, ExchangePhase::Successful)
    }

    /// The bitcoin already committed by finished steps, rounded down to
    /// whole satoshi.
    pub fn completed_amount(&self) -> BitcoinAmount {
        self.bitcoin_amount
            .scaled(self.steps_completed, self.step_count)
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// The state machine proper. See the module docs for the diagram.
#[derive(Debug, Clone)]
pub struct ExchangeStateMachine {
    params: ExchangeParams,
    phase: ExchangePhase,
    local_info: Option<PeerInfo>,
    remote_info: Option<PeerInfo>,
    deposits: Option<Deposits>,
}

impl ExchangeStateMachine {
    /// Creates a machine in `NonStarted` for the given parameters.
    pub fn new(params: ExchangeParams) -> Self {
        Self {
            params,
            phase: ExchangePhase::NonStarted,
            local_info: None,
            remote_info: None,
            deposits: None,
        }
    }

    /// The fixed parameters.
    pub fn params(&self) -> &ExchangeParams {
        &self.params
    }

    /// Current phase.
    pub fn phase(&self) -> &ExchangePhase {
        &self.phase
    }

    /// Our own announced info, once the handshake started.
    pub fn local_info(&self) -> Option<&PeerInfo> {
        self.local_info.as_ref()
    }

    /// Counterpart info learned during the handshake, if any.
    pub fn remote_info(&self) -> Option<&PeerInfo> {
        self.remote_info.as_ref()
    }

    /// The funded deposits, once the exchange started.
    pub fn deposits(&self) -> Option<&Deposits> {
        self.deposits.as_ref()
    }

    /// Steps committed so far.
    pub fn steps_completed(&self) -> u32 {
        match self.phase {
            ExchangePhase::Exchanging { steps_completed } => steps_completed,
            ExchangePhase::Successful => self.params.step_count,
            _ => 0,
        }
    }

    /// Begins the handshake, announcing our own info.
    pub fn start_handshake(&mut self, local: PeerInfo) -> Result<(), InvalidTransition> {
        match self.phase {
            ExchangePhase::NonStarted => {
                self.local_info = Some(local);
                self.phase = ExchangePhase::Handshaking;
                Ok(())
            }
            _ => Err(self.invalid("start_handshake")),
        }
    }

    /// Records the counterpart's announced info. Re-announcements with
    /// identical content are idempotent; a *different* announcement for
    /// the same exchange is rejected — keys do not change mid-trade.
    pub fn record_remote_info(&mut self, remote: PeerInfo) -> Result<(), InvalidTransition> {
        match self.phase {
            ExchangePhase::Handshaking => match &self.remote_info {
                None => {
                    self.remote_info = Some(remote);
                    Ok(())
                }
                Some(existing) if *existing == remote => Ok(()),
                Some(_) => Err(self.invalid("conflicting remote info")),
            },
            _ => Err(self.invalid("remote_info")),
        }
    }

    /// Moves from handshake to the step loop, both deposits funded.
    pub fn start_exchange(&mut self, deposits: Deposits) -> Result<(), InvalidTransition> {
        match self.phase {
            ExchangePhase::Handshaking if self.remote_info.is_some() => {
                self.deposits = Some(deposits);
                self.phase = ExchangePhase::Exchanging { steps_completed: 0 };
                Ok(())
            }
            _ => Err(self.invalid("start_exchange")),
        }
    }

    /// Commits step `step` (1-based). Steps commit strictly in order;
    /// already-committed steps are [`StepOutcome::Duplicate`], future
    /// steps are invalid.
    pub fn complete_step(&mut self, step: u32) -> Result<StepOutcome, InvalidTransition> {
        let ExchangePhase::Exchanging { steps_completed } = self.phase else {
            return Err(self.invalid("complete_step"));
        };

        if step == 0 || step > self.params.step_count {
            return Err(self.invalid("step index out of range"));
        }
        if step <= steps_completed {
            return Ok(StepOutcome::Duplicate);
        }
        if step != steps_completed + 1 {
            return Err(self.invalid("step out of order"));
        }

        if step == self.params.step_count {
            self.phase = ExchangePhase::Successful;
            Ok(StepOutcome::Completed)
        } else {
            self.phase = ExchangePhase::Exchanging {
                steps_completed: step,
            };
            Ok(StepOutcome::Advanced(step))
        }
    }

    /// Abandons the exchange. During the handshake no funds were at risk
    /// and the result is `Aborted`; mid-exchange the result is `Failed`
    /// and the runner broadcasts refunds.
    pub fn abort(&mut self, cause: impl Into<String>) -> Result<(), InvalidTransition> {
        match self.phase {
            ExchangePhase::NonStarted | ExchangePhase::Handshaking => {
                self.phase = ExchangePhase::Aborted {
                    cause: cause.into(),
                };
                Ok(())
            }
            ExchangePhase::Exchanging { .. } => {
                self.phase = ExchangePhase::Failed {
                    cause: cause.into(),
                };
                Ok(())
            }
            _ => Err(self.invalid("abort")),
        }
    }

    /// Fails the exchange from any non-terminal phase.
    pub fn fail(&mut self, cause: impl Into<String>) -> Result<(), InvalidTransition> {
        if self.phase.is_terminal() {
            return Err(self.invalid("fail"));
        }
        self.phase = ExchangePhase::Failed {
            cause: cause.into(),
        };
        Ok(())
    }

    /// The current snapshot, as stored by the order controller.
    pub fn snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            exchange_id: self.params.exchange_id,
            role: self.params.role,
            counterpart: self.params.counterpart,
            bitcoin_amount: self.params.bitcoin_amount,
            fiat_amount: self.params.fiat_amount,
            step_count: self.params.step_count,
            steps_completed: self.steps_completed(),
            phase: self.phase.clone(),
        }
    }

    fn invalid(&self, input: &'static str) -> InvalidTransition {
        InvalidTransition {
            phase: self.phase.name(),
            input,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TradeKeypair;
    use crate::ids::BROKER_ID;
    use crate::money::Currency;
    use crate::wallet::{TransactionTemplate, TxKind};

    fn params(steps: u32) -> ExchangeParams {
        ExchangeParams {
            exchange_id: ExchangeId::random(),
            role: ExchangeRole::Buyer,
            step_count: steps,
            bitcoin_amount: BitcoinAmount::from_btc(10),
            fiat_amount: FiatAmount::from_major(100, Currency::Eur),
            counterpart: BROKER_ID,
        }
    }

    fn info(name: &str) -> PeerInfo {
        PeerInfo {
            account_id: AccountId::new(name),
            public_key: TradeKeypair::generate().public_key(),
        }
    }

    fn tx_hash(tag: u32) -> TxHash {
        TxHash::of(&TransactionTemplate {
            kind: TxKind::Refund {
                exchange_id: ExchangeId::random(),
                depositor: BROKER_ID,
            },
            amount: BitcoinAmount::from_sat(tag as u64),
            lock_time: None,
        })
    }

    fn deposits() -> Deposits {
        Deposits {
            buyer: tx_hash(1),
            seller: tx_hash(2),
        }
    }

    fn exchanging_machine(steps: u32) -> ExchangeStateMachine {
        let mut machine = ExchangeStateMachine::new(params(steps));
        machine.start_handshake(info("local")).unwrap();
        machine.record_remote_info(info("remote")).unwrap();
        machine.start_exchange(deposits()).unwrap();
        machine
    }

    #[test]
    fn happy_path_to_successful() {
        let mut machine = exchanging_machine(3);
        assert_eq!(machine.complete_step(1), Ok(StepOutcome::Advanced(1)));
        assert_eq!(machine.complete_step(2), Ok(StepOutcome::Advanced(2)));
        assert_eq!(machine.complete_step(3), Ok(StepOutcome::Completed));
        assert_eq!(*machine.phase(), ExchangePhase::Successful);
        assert_eq!(machine.steps_completed(), 3);
    }

    #[test]
    fn duplicate_steps_are_acknowledged_not_replayed() {
        let mut machine = exchanging_machine(3);
        machine.complete_step(1).unwrap();
        assert_eq!(machine.complete_step(1), Ok(StepOutcome::Duplicate));
        assert_eq!(machine.steps_completed(), 1);
    }

    #[test]
    fn out_of_order_step_rejected() {
        let mut machine = exchanging_machine(5);
        machine.complete_step(1).unwrap();
        let err = machine.complete_step(3).unwrap_err();
        assert_eq!(err.input, "step out of order");
        // Nothing moved.
        assert_eq!(machine.steps_completed(), 1);
    }

    #[test]
    fn step_out_of_range_rejected() {
        let mut machine = exchanging_machine(3);
        assert!(machine.complete_step(0).is_err());
        assert!(machine.complete_step(4).is_err());
    }

    #[test]
    fn steps_completed_is_monotone() {
        let mut machine = exchanging_machine(4);
        let mut seen = 0;
        for step in 1..=4 {
            machine.complete_step(step).unwrap();
            assert!(machine.steps_completed() >= seen);
            seen = machine.steps_completed();
        }
    }

    #[test]
    fn single_step_exchange_is_valid() {
        let mut machine = exchanging_machine(1);
        assert_eq!(machine.complete_step(1), Ok(StepOutcome::Completed));
        assert!(machine.snapshot().is_successful());
    }

    #[test]
    fn abort_during_handshake_is_aborted() {
        let mut machine = ExchangeStateMachine::new(params(3));
        machine.start_handshake(info("local")).unwrap();
        machine.abort("handshake timeout").unwrap();
        assert!(matches!(machine.phase(), ExchangePhase::Aborted { .. }));
    }

    #[test]
    fn abort_mid_exchange_is_failed() {
        let mut machine = exchanging_machine(3);
        machine.complete_step(1).unwrap();
        machine.abort("counterpart abort").unwrap();
        assert!(matches!(machine.phase(), ExchangePhase::Failed { .. }));
    }

    #[test]
    fn terminal_phases_are_immutable() {
        let mut machine = exchanging_machine(1);
        machine.complete_step(1).unwrap();

        assert!(machine.complete_step(1).is_err());
        assert!(machine.fail("too late").is_err());
        assert!(machine.abort("too late").is_err());
        assert_eq!(*machine.phase(), ExchangePhase::Successful);
    }

    #[test]
    fn exchange_requires_remote_info() {
        let mut machine = ExchangeStateMachine::new(params(3));
        machine.start_handshake(info("local")).unwrap();
        assert!(machine.start_exchange(deposits()).is_err());
    }

    #[test]
    fn remote_info_is_idempotent_but_not_mutable() {
        let mut machine = ExchangeStateMachine::new(params(3));
        machine.start_handshake(info("local")).unwrap();
        let remote = info("remote");
        machine.record_remote_info(remote.clone()).unwrap();
        machine.record_remote_info(remote).unwrap();
        assert!(machine.record_remote_info(info("imposter")).is_err());
    }

    #[test]
    fn step_messages_in_wrong_phase_are_dropped_not_panicked() {
        let mut machine = ExchangeStateMachine::new(params(3));
        assert!(machine.complete_step(1).is_err());
        machine.start_handshake(info("local")).unwrap();
        assert!(machine.complete_step(1).is_err());
        assert_eq!(*machine.phase(), ExchangePhase::Handshaking);
    }

    #[test]
    fn snapshot_reflects_progress() {
        let mut machine = exchanging_machine(10);
        for step in 1..=5 {
            machine.complete_step(step).unwrap();
        }
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.steps_completed, 5);
        assert!(snapshot.is_running());
        assert_eq!(snapshot.completed_amount(), BitcoinAmount::from_btc(5));
    }
}
