//! # Exchange runner
//!
//! The actor that drives one [`ExchangeStateMachine`] against the real
//! world: the wallet, the payment processor and the relay. One runner
//! task per exchange; it consumes its own mailbox of [`TradeMessage`]s
//! (routed to it by the peer engine), talks to the counterpart through
//! the relay, and reports progress plus exactly one terminal event to
//! its parent order.
//!
//! Message loss is survived by retransmitting the outstanding message on
//! a fixed cadence; the `(exchange_id, step)` idempotence key on the
//! receiving side makes that harmless. Every wait carries a deadline —
//! a silent counterpart costs a bounded amount of time, never a hang.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::machine::{
    Deposits, ExchangeParams, ExchangeRole, ExchangeSnapshot, ExchangeStateMachine, PeerInfo,
    StepOutcome,
};
use super::messages::TradeMessage;
use crate::broker::{BrokerMessage, ExchangeRejection};
use crate::config::{
    BUYER_BOND_STEPS, DEPOSIT_CONFIRMATIONS, REFUND_LOCK_BLOCKS, TRADE_RETRY_INTERVAL,
};
use crate::crypto::TradeKeypair;
use crate::ids::{ExchangeId, OverlayId, BROKER_ID};
use crate::money::{BitcoinAmount, FiatAmount};
use crate::payment::{PaymentError, PaymentProcessor};
use crate::relay::RelayHandle;
use crate::wallet::{SignedPartial, TransactionTemplate, TxHash, TxKind, Wallet, WalletError};

/// Mailbox capacity per runner.
const INBOX_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

/// Terminal causes of an exchange. Reported to the parent order; the
/// order decides whether it returns to the market.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// No usable counterpart activity within the handshake timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The counterpart went silent inside step `step`.
    #[error("step {step} timed out")]
    StepTimeout {
        /// The step that was in flight.
        step: u32,
    },

    /// The counterpart walked away at a step boundary.
    #[error("counterpart aborted: {reason}")]
    CounterpartAbort {
        /// The counterpart's stated reason.
        reason: String,
    },

    /// The counterpart sent something cryptographically or structurally
    /// wrong. It gets blacklisted for the session.
    #[error("protocol violation: {detail}")]
    ProtocolViolation {
        /// What was wrong.
        detail: String,
    },

    /// The order owning this exchange was cancelled; the runner stopped
    /// at the step boundary.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason from the order.
        reason: String,
    },

    /// The wallet failed mid-exchange.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// The payment processor failed mid-exchange.
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// What a runner reports upward.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    /// The snapshot changed (phase or step counter).
    Progress(ExchangeSnapshot),
    /// Terminal: every step committed.
    Success(ExchangeSnapshot),
    /// Terminal: the exchange died.
    Failure {
        /// Final snapshot.
        snapshot: ExchangeSnapshot,
        /// What killed it.
        cause: ExchangeError,
    },
}

/// Sink for runner events, keyed by exchange so one consumer can own
/// many runners.
pub type ExchangeEventSink = mpsc::UnboundedSender<(ExchangeId, ExchangeEvent)>;

// ---------------------------------------------------------------------------
// Context and handle
// ---------------------------------------------------------------------------

/// Everything a runner needs from its environment.
#[derive(Clone)]
pub struct ExchangeContext {
    /// Our own overlay id (deposits and releases are labelled with it).
    pub local_id: OverlayId,
    /// The process-wide wallet.
    pub wallet: Arc<dyn Wallet>,
    /// The process-wide payment processor.
    pub payment: Arc<dyn PaymentProcessor>,
    /// Relay for counterpart and broker traffic.
    pub relay: RelayHandle,
    /// Handshake deadline.
    pub handshake_timeout: Duration,
    /// Per-step deadline.
    pub step_timeout: Duration,
    /// Retransmission cadence.
    pub retry_interval: Duration,
}

impl ExchangeContext {
    /// Context with the default retransmission cadence.
    pub fn new(
        local_id: OverlayId,
        wallet: Arc<dyn Wallet>,
        payment: Arc<dyn PaymentProcessor>,
        relay: RelayHandle,
        handshake_timeout: Duration,
        step_timeout: Duration,
    ) -> Self {
        Self {
            local_id,
            wallet,
            payment,
            relay,
            handshake_timeout,
            step_timeout,
            retry_interval: TRADE_RETRY_INTERVAL,
        }
    }
}

/// Handle held by the owning controller: message delivery and
/// non-preemptive cancellation.
pub struct ExchangeRunnerHandle {
    exchange_id: ExchangeId,
    inbox: mpsc::Sender<TradeMessage>,
    cancel: watch::Sender<Option<String>>,
}

impl ExchangeRunnerHandle {
    /// The exchange this handle belongs to.
    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange_id
    }

    /// Delivers an inbound trade message. Best-effort: a full mailbox
    /// drops the message, the counterpart will retransmit.
    pub fn deliver(&self, message: TradeMessage) {
        if self.inbox.try_send(message).is_err() {
            debug!(exchange_id = %self.exchange_id, "runner inbox full, message dropped");
        }
    }

    /// Requests cancellation. Non-preemptive: the runner observes it at
    /// the next step boundary.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.cancel.send(Some(reason.into()));
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Spawns exchange runner tasks.
pub struct ExchangeRunner;

impl ExchangeRunner {
    /// Spawns the runner for `params` and returns its handle. Exactly
    /// one terminal event will eventually reach `events`.
    pub fn spawn(
        params: ExchangeParams,
        ctx: ExchangeContext,
        events: ExchangeEventSink,
    ) -> ExchangeRunnerHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let handle = ExchangeRunnerHandle {
            exchange_id: params.exchange_id,
            inbox: inbox_tx,
            cancel: cancel_tx,
        };
        tokio::spawn(run(params, ctx, inbox_rx, cancel_rx, events));
        handle
    }
}

async fn run(
    params: ExchangeParams,
    ctx: ExchangeContext,
    mut inbox: mpsc::Receiver<TradeMessage>,
    cancel: watch::Receiver<Option<String>>,
    events: ExchangeEventSink,
) {
    let exchange_id = params.exchange_id;
    let mut machine = ExchangeStateMachine::new(params);

    match drive(&mut machine, &ctx, &mut inbox, &cancel, &events).await {
        Ok(()) => {
            let snapshot = machine.snapshot();
            info!(%exchange_id, "exchange successful");
            let _ = events.send((exchange_id, ExchangeEvent::Success(snapshot)));
        }
        Err(cause) => {
            if !machine.phase().is_terminal() {
                // Drive already aborted the machine on protocol-level
                // failures; this covers wallet/payment errors.
                let _ = machine.fail(cause.to_string());
            }
            warn!(%exchange_id, %cause, "exchange failed");
            let _ = events.send((
                exchange_id,
                ExchangeEvent::Failure {
                    snapshot: machine.snapshot(),
                    cause,
                },
            ));
        }
    }
}

fn emit_progress(machine: &ExchangeStateMachine, events: &ExchangeEventSink) {
    let _ = events.send((
        machine.params().exchange_id,
        ExchangeEvent::Progress(machine.snapshot()),
    ));
}

/// A state machine misuse inside the runner is a bug, not a counterpart
/// problem; it still must not panic a production peer.
fn internal(e: super::machine::InvalidTransition) -> ExchangeError {
    ExchangeError::ProtocolViolation {
        detail: format!("internal transition error: {e}"),
    }
}

async fn drive(
    machine: &mut ExchangeStateMachine,
    ctx: &ExchangeContext,
    inbox: &mut mpsc::Receiver<TradeMessage>,
    cancel: &watch::Receiver<Option<String>>,
    events: &ExchangeEventSink,
) -> Result<(), ExchangeError> {
    let params = machine.params().clone();
    let key = ctx.wallet.create_key_pair().await;
    let account_id = ctx.payment.retrieve_account_id().await;
    let local_info = PeerInfo {
        account_id,
        public_key: key.public_key(),
    };
    let handshake_started = Utc::now();

    machine.start_handshake(local_info.clone()).map_err(internal)?;
    emit_progress(machine, events);

    let deposits = handshake(machine, ctx, &key, &local_info, inbox, cancel).await?;
    machine.start_exchange(deposits).map_err(internal)?;
    emit_progress(machine, events);

    let btc_steps = params
        .bitcoin_amount
        .split_even(params.step_count)
        .expect("step_count validated >= 1 at config load");
    let fiat_steps = params
        .fiat_amount
        .split_even(params.step_count)
        .expect("step_count validated >= 1 at config load");

    let mut credit_since = handshake_started;
    let mut last_complete: Option<TradeMessage> = None;

    for step in 1..=params.step_count {
        // Cancellation is observed only here, at the step boundary. The
        // watch ref must not live across an await.
        let cancel_reason = cancel.borrow().clone();
        if let Some(reason) = cancel_reason {
            send_trade(
                ctx,
                params.counterpart,
                &TradeMessage::Abort {
                    exchange_id: params.exchange_id,
                    reason: reason.clone(),
                },
            )
            .await;
            abort_with_refund(machine, ctx, &key, "cancelled").await;
            return Err(ExchangeError::Cancelled { reason });
        }

        let result = match params.role {
            ExchangeRole::Buyer => {
                buyer_step(machine, ctx, &key, step, fiat_steps[step as usize - 1],
                    btc_steps[step as usize - 1], inbox)
                .await
            }
            ExchangeRole::Seller => {
                seller_step(
                    machine,
                    ctx,
                    &key,
                    step,
                    fiat_steps[step as usize - 1],
                    btc_steps[step as usize - 1],
                    &mut credit_since,
                    &mut last_complete,
                    inbox,
                )
                .await
            }
        };

        match result {
            Ok(()) => {
                match machine.complete_step(step).map_err(internal)? {
                    StepOutcome::Advanced(_) => emit_progress(machine, events),
                    StepOutcome::Completed => {} // terminal Success is emitted by run()
                    StepOutcome::Duplicate => {}
                }
            }
            Err(cause) => {
                abort_with_refund(machine, ctx, &key, &cause.to_string()).await;
                return Err(cause);
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

fn deposit_amount(params: &ExchangeParams) -> BitcoinAmount {
    match params.role {
        // The seller collateralizes the full amount being sold.
        ExchangeRole::Seller => params.bitcoin_amount,
        // The buyer posts a bond worth a couple of steps.
        ExchangeRole::Buyer => params
            .bitcoin_amount
            .scaled(BUYER_BOND_STEPS.min(params.step_count), params.step_count),
    }
}

async fn handshake(
    machine: &mut ExchangeStateMachine,
    ctx: &ExchangeContext,
    key: &TradeKeypair,
    local_info: &PeerInfo,
    inbox: &mut mpsc::Receiver<TradeMessage>,
    cancel: &watch::Receiver<Option<String>>,
) -> Result<Deposits, ExchangeError> {
    let params = machine.params().clone();
    let deadline = Instant::now() + ctx.handshake_timeout;

    let announce = TradeMessage::Handshake {
        exchange_id: params.exchange_id,
        info: local_info.clone(),
    };
    send_trade(ctx, params.counterpart, &announce).await;

    let mut local_deposit: Option<(TxHash, TradeMessage)> = None;
    let mut remote_deposit: Option<TxHash> = None;

    loop {
        let cancel_reason = cancel.borrow().clone();
        if let Some(reason) = cancel_reason {
            // Before the deposit goes out a cancellation is fund-safe;
            // after it, the exchange fails and the refund goes out.
            if local_deposit.is_some() {
                fail_handshake(machine, ctx, &params, key, "cancelled", true).await;
            } else {
                abort_handshake(machine, ctx, &params, "cancelled").await;
            }
            return Err(ExchangeError::Cancelled { reason });
        }

        // Once we know the counterpart, fund our own deposit.
        if machine.remote_info().is_some() && local_deposit.is_none() {
            let template = TransactionTemplate {
                kind: TxKind::Deposit {
                    exchange_id: params.exchange_id,
                    depositor: ctx.local_id,
                },
                amount: deposit_amount(&params),
                lock_time: Some(REFUND_LOCK_BLOCKS),
            };
            let partial = ctx.wallet.sign_partial(&template, key).await;
            let tx_hash = ctx.wallet.broadcast(&partial).await?;
            if let Err(e) = await_confirmations(ctx, &tx_hash, deadline).await {
                // The deposit is already on-chain even though it never
                // confirmed in time.
                fail_handshake(machine, ctx, &params, key, "handshake timeout", true).await;
                return Err(e);
            }

            let proof = TradeMessage::DepositProof {
                exchange_id: params.exchange_id,
                partial,
                tx_hash,
            };
            send_trade(ctx, params.counterpart, &proof).await;
            debug!(exchange_id = %params.exchange_id, %tx_hash, "deposit funded");
            local_deposit = Some((tx_hash, proof));
        }

        if let (Some((local_hash, _)), Some(remote_hash)) = (&local_deposit, &remote_deposit) {
            let deposits = match params.role {
                ExchangeRole::Buyer => Deposits {
                    buyer: *local_hash,
                    seller: *remote_hash,
                },
                ExchangeRole::Seller => Deposits {
                    buyer: *remote_hash,
                    seller: *local_hash,
                },
            };
            return Ok(deposits);
        }

        if Instant::now() >= deadline {
            fail_handshake(
                machine,
                ctx,
                &params,
                key,
                "handshake timeout",
                local_deposit.is_some(),
            )
            .await;
            return Err(ExchangeError::HandshakeTimeout);
        }

        match tokio::time::timeout(ctx.retry_interval, inbox.recv()).await {
            Ok(Some(TradeMessage::Handshake { info, .. })) => {
                match machine.record_remote_info(info) {
                    Ok(()) => {}
                    Err(e) => {
                        fail_handshake(
                            machine,
                            ctx,
                            &params,
                            key,
                            "conflicting peer info",
                            local_deposit.is_some(),
                        )
                        .await;
                        return Err(ExchangeError::ProtocolViolation {
                            detail: e.to_string(),
                        });
                    }
                }
            }
            Ok(Some(TradeMessage::DepositProof {
                partial, tx_hash, ..
            })) => {
                if let Err(e) = validate_deposit_proof(machine, &params, &partial) {
                    fail_handshake(
                        machine,
                        ctx,
                        &params,
                        key,
                        "invalid deposit proof",
                        local_deposit.is_some(),
                    )
                    .await;
                    return Err(e);
                }
                remote_deposit = Some(tx_hash);
            }
            Ok(Some(TradeMessage::Abort { reason, .. })) => {
                fail_handshake(machine, ctx, &params, key, &reason, local_deposit.is_some())
                    .await;
                return Err(ExchangeError::CounterpartAbort { reason });
            }
            Ok(Some(other)) => {
                // A step message arriving during our handshake just means
                // the counterpart is ahead; it will retransmit.
                debug!(exchange_id = %params.exchange_id, "dropping early {:?} during handshake",
                    std::mem::discriminant(&other));
            }
            Ok(None) => {
                if local_deposit.is_some() {
                    fail_handshake(machine, ctx, &params, key, "engine shutdown", true).await;
                } else {
                    abort_handshake(machine, ctx, &params, "engine shutdown").await;
                }
                return Err(ExchangeError::Cancelled {
                    reason: "engine shutdown".to_string(),
                });
            }
            Err(_elapsed) => {
                // Retry tick: retransmit whatever we are still owed an
                // answer for.
                if machine.remote_info().is_none() {
                    send_trade(ctx, params.counterpart, &announce).await;
                } else if let (Some((_, proof)), None) = (&local_deposit, &remote_deposit) {
                    send_trade(ctx, params.counterpart, proof).await;
                }
            }
        }
    }
}

fn validate_deposit_proof(
    machine: &ExchangeStateMachine,
    params: &ExchangeParams,
    partial: &SignedPartial,
) -> Result<(), ExchangeError> {
    let remote_key = machine
        .remote_info()
        .map(|info| info.public_key.clone())
        .ok_or(ExchangeError::ProtocolViolation {
            detail: "deposit proof before peer info".to_string(),
        })?;
    if partial.signer != remote_key || !partial.verify() {
        return Err(ExchangeError::ProtocolViolation {
            detail: "deposit proof signature invalid".to_string(),
        });
    }
    match &partial.template.kind {
        TxKind::Deposit {
            exchange_id,
            depositor,
        } if *exchange_id == params.exchange_id && *depositor == params.counterpart => {}
        _ => {
            return Err(ExchangeError::ProtocolViolation {
                detail: "deposit proof for wrong transaction".to_string(),
            })
        }
    }
    if partial.template.amount.is_zero() {
        return Err(ExchangeError::ProtocolViolation {
            detail: "zero-value deposit".to_string(),
        });
    }
    Ok(())
}

async fn await_confirmations(
    ctx: &ExchangeContext,
    tx_hash: &TxHash,
    deadline: Instant,
) -> Result<(), ExchangeError> {
    loop {
        let confirmations = ctx.wallet.confirmations(tx_hash).await?;
        if confirmations >= DEPOSIT_CONFIRMATIONS {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ExchangeError::HandshakeTimeout);
        }
        tokio::time::sleep(ctx.retry_interval / 4).await;
    }
}

/// Fund-safe abandonment of the handshake: nothing of ours is on-chain,
/// so the exchange ends `Aborted` and there is no refund to broadcast.
/// Reserved for cancellations before the local deposit goes out.
async fn abort_handshake(
    machine: &mut ExchangeStateMachine,
    ctx: &ExchangeContext,
    params: &ExchangeParams,
    cause: &str,
) {
    if let Err(e) = machine.abort(cause) {
        debug!(exchange_id = %params.exchange_id, %e, "abort in terminal phase ignored");
    }
    notify_abandonment(ctx, params, cause).await;
}

/// Abandonment of a handshake that may have consequences: timeouts,
/// counterpart aborts and protocol violations fall back to `Failed`,
/// and once our deposit is on-chain the time-locked refund goes out
/// with it. An `Aborted` exchange never broadcasts a refund — that
/// phase means no funds were ever at risk.
async fn fail_handshake(
    machine: &mut ExchangeStateMachine,
    ctx: &ExchangeContext,
    params: &ExchangeParams,
    key: &TradeKeypair,
    cause: &str,
    deposit_funded: bool,
) {
    if let Err(e) = machine.fail(cause) {
        debug!(exchange_id = %params.exchange_id, %e, "fail in terminal phase ignored");
    }
    if deposit_funded {
        broadcast_refund(machine, ctx, key).await;
    }
    notify_abandonment(ctx, params, cause).await;
}

/// Broker rejection plus counterpart abort, shared by both abandonment
/// paths. The broker learns about abandoned matches so it can re-match
/// the counterpart.
async fn notify_abandonment(ctx: &ExchangeContext, params: &ExchangeParams, cause: &str) {
    let rejection = BrokerMessage::Rejection(ExchangeRejection {
        exchange_id: params.exchange_id,
        cause: cause.to_string(),
    });
    if let Err(e) = ctx.relay.send(BROKER_ID, rejection.encode()).await {
        warn!(exchange_id = %params.exchange_id, %e, "could not report rejection to broker");
    }
    let abort = TradeMessage::Abort {
        exchange_id: params.exchange_id,
        reason: cause.to_string(),
    };
    send_trade(ctx, params.counterpart, &abort).await;
}

// ---------------------------------------------------------------------------
// Step loop, buyer side
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn buyer_step(
    machine: &mut ExchangeStateMachine,
    ctx: &ExchangeContext,
    key: &TradeKeypair,
    step: u32,
    fiat_step: FiatAmount,
    btc_step: BitcoinAmount,
    inbox: &mut mpsc::Receiver<TradeMessage>,
) -> Result<(), ExchangeError> {
    let params = machine.params().clone();
    let remote = machine
        .remote_info()
        .cloned()
        .ok_or(ExchangeError::ProtocolViolation {
            detail: "step loop without peer info".to_string(),
        })?;

    // Fiat first: the micro-payment is what buys this step's release.
    let receipt = ctx.payment.pay(step, fiat_step, &remote.account_id).await?;
    debug!(exchange_id = %params.exchange_id, step, payment = %receipt.payment_id, "fiat step paid");

    let template = TransactionTemplate {
        kind: TxKind::StepRelease {
            exchange_id: params.exchange_id,
            step,
            depositor: params.counterpart,
        },
        amount: btc_step,
        lock_time: None,
    };
    let partial = ctx.wallet.sign_partial(&template, key).await;
    let release = TradeMessage::StepRelease {
        exchange_id: params.exchange_id,
        step,
        partial,
        receipt,
    };
    send_trade(ctx, params.counterpart, &release).await;

    let deadline = Instant::now() + ctx.step_timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(ExchangeError::StepTimeout { step });
        }
        match tokio::time::timeout(ctx.retry_interval, inbox.recv()).await {
            Ok(Some(TradeMessage::StepComplete {
                step: got,
                partial,
                ..
            })) => {
                if got < step {
                    // Stale completion the seller retransmitted; tell it
                    // we have moved on.
                    send_trade(
                        ctx,
                        params.counterpart,
                        &TradeMessage::StepAck {
                            exchange_id: params.exchange_id,
                            step: got,
                        },
                    )
                    .await;
                    continue;
                }
                if got != step {
                    return Err(ExchangeError::ProtocolViolation {
                        detail: format!("completion for future step {got} in step {step}"),
                    });
                }
                validate_step_release(&partial, &remote, &params, step, btc_step, ctx.local_id)?;
                return Ok(());
            }
            Ok(Some(TradeMessage::Abort { reason, .. })) => {
                return Err(ExchangeError::CounterpartAbort { reason });
            }
            Ok(Some(TradeMessage::StepAck { .. })) => continue,
            Ok(Some(other)) => {
                debug!(exchange_id = %params.exchange_id, step,
                    "dropping unexpected {:?} in buyer step", std::mem::discriminant(&other));
            }
            Ok(None) => {
                return Err(ExchangeError::Cancelled {
                    reason: "engine shutdown".to_string(),
                })
            }
            Err(_elapsed) => {
                send_trade(ctx, params.counterpart, &release).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Step loop, seller side
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn seller_step(
    machine: &mut ExchangeStateMachine,
    ctx: &ExchangeContext,
    key: &TradeKeypair,
    step: u32,
    fiat_step: FiatAmount,
    btc_step: BitcoinAmount,
    credit_since: &mut DateTime<Utc>,
    last_complete: &mut Option<TradeMessage>,
    inbox: &mut mpsc::Receiver<TradeMessage>,
) -> Result<(), ExchangeError> {
    let params = machine.params().clone();
    let remote = machine
        .remote_info()
        .cloned()
        .ok_or(ExchangeError::ProtocolViolation {
            detail: "step loop without peer info".to_string(),
        })?;

    let deadline = Instant::now() + ctx.step_timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(ExchangeError::StepTimeout { step });
        }
        match tokio::time::timeout(ctx.retry_interval, inbox.recv()).await {
            Ok(Some(TradeMessage::StepRelease {
                step: got, partial, ..
            })) => {
                if got < step {
                    // The buyer missed our completion of an earlier step:
                    // resend it, then the idempotence ack.
                    if let Some(complete) = last_complete.as_ref() {
                        send_trade(ctx, params.counterpart, complete).await;
                    }
                    send_trade(
                        ctx,
                        params.counterpart,
                        &TradeMessage::StepAck {
                            exchange_id: params.exchange_id,
                            step: got,
                        },
                    )
                    .await;
                    continue;
                }
                if got != step {
                    return Err(ExchangeError::ProtocolViolation {
                        detail: format!("release for future step {got} in step {step}"),
                    });
                }
                validate_step_release(&partial, &remote, &params, step, btc_step, ctx.local_id)?;

                // The partial only proves intent; the fiat credit is the
                // real thing, verified against our own processor.
                await_credit(ctx, fiat_step, *credit_since, deadline, step).await?;

                // Co-sign and commit the release on-chain.
                let co_signed = ctx.wallet.sign_partial(&partial.template, key).await;
                ctx.wallet.broadcast(&co_signed).await?;
                *credit_since = Utc::now();

                // Hand the buyer the release of its own deposit share.
                let buyer_template = TransactionTemplate {
                    kind: TxKind::StepRelease {
                        exchange_id: params.exchange_id,
                        step,
                        depositor: params.counterpart,
                    },
                    amount: btc_step.scaled(
                        BUYER_BOND_STEPS.min(params.step_count),
                        params.step_count,
                    ),
                    lock_time: None,
                };
                let buyer_partial = ctx.wallet.sign_partial(&buyer_template, key).await;
                let complete = TradeMessage::StepComplete {
                    exchange_id: params.exchange_id,
                    step,
                    partial: buyer_partial,
                };
                send_trade(ctx, params.counterpart, &complete).await;
                *last_complete = Some(complete);
                return Ok(());
            }
            Ok(Some(TradeMessage::Abort { reason, .. })) => {
                return Err(ExchangeError::CounterpartAbort { reason });
            }
            Ok(Some(TradeMessage::StepAck { .. })) => continue,
            Ok(Some(other)) => {
                debug!(exchange_id = %params.exchange_id, step,
                    "dropping unexpected {:?} in seller step", std::mem::discriminant(&other));
            }
            Ok(None) => {
                return Err(ExchangeError::Cancelled {
                    reason: "engine shutdown".to_string(),
                })
            }
            Err(_elapsed) => {
                // Nothing to retransmit: the buyer owes us the next move.
            }
        }
    }
}

fn validate_step_release(
    partial: &SignedPartial,
    remote: &PeerInfo,
    params: &ExchangeParams,
    step: u32,
    expected_amount: BitcoinAmount,
    local_id: OverlayId,
) -> Result<(), ExchangeError> {
    if partial.signer != remote.public_key || !partial.verify() {
        return Err(ExchangeError::ProtocolViolation {
            detail: format!("step {step} release signature invalid"),
        });
    }
    match &partial.template.kind {
        TxKind::StepRelease {
            exchange_id,
            step: tpl_step,
            depositor,
        } if *exchange_id == params.exchange_id
            && *tpl_step == step
            && *depositor == local_id => {}
        _ => {
            return Err(ExchangeError::ProtocolViolation {
                detail: format!("step {step} release for wrong transaction"),
            })
        }
    }
    // The buyer-bond release is a scaled-down amount; anything *larger*
    // than the full step is an attempt to over-drain the deposit.
    if partial.template.amount > expected_amount {
        return Err(ExchangeError::ProtocolViolation {
            detail: format!("step {step} release exceeds the step amount"),
        });
    }
    Ok(())
}

async fn await_credit(
    ctx: &ExchangeContext,
    expected: FiatAmount,
    since: DateTime<Utc>,
    deadline: Instant,
    step: u32,
) -> Result<(), ExchangeError> {
    loop {
        if ctx.payment.verify_credit(expected, since).await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ExchangeError::StepTimeout { step });
        }
        tokio::time::sleep(ctx.retry_interval / 4).await;
    }
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

async fn abort_with_refund(
    machine: &mut ExchangeStateMachine,
    ctx: &ExchangeContext,
    key: &TradeKeypair,
    cause: &str,
) {
    if !machine.phase().is_terminal() {
        if let Err(e) = machine.abort(cause) {
            debug!(%e, "abort on terminal machine ignored");
        }
    }
    broadcast_refund(machine, ctx, key).await;
}

/// Reclaims the un-released remainder of our own deposit through the
/// time-locked clause. Best-effort: a wallet failure here is logged, the
/// time-lock guarantees the funds stay reclaimable later.
async fn broadcast_refund(
    machine: &ExchangeStateMachine,
    ctx: &ExchangeContext,
    key: &TradeKeypair,
) {
    let params = machine.params();
    let deposited = deposit_amount(params);
    let released = deposited.scaled(machine.steps_completed(), params.step_count);
    let remainder = match deposited.checked_sub(released) {
        Ok(r) if !r.is_zero() => r,
        _ => return,
    };

    let template = TransactionTemplate {
        kind: TxKind::Refund {
            exchange_id: params.exchange_id,
            depositor: ctx.local_id,
        },
        amount: remainder,
        lock_time: Some(REFUND_LOCK_BLOCKS),
    };
    let partial = ctx.wallet.sign_partial(&template, key).await;
    match ctx.wallet.broadcast(&partial).await {
        Ok(tx_hash) => {
            info!(exchange_id = %params.exchange_id, %tx_hash, %remainder, "refund broadcast")
        }
        Err(e) => {
            warn!(exchange_id = %params.exchange_id, %e, "refund broadcast failed, retry after lock")
        }
    }
}

async fn send_trade(ctx: &ExchangeContext, to: OverlayId, message: &TradeMessage) {
    // Best-effort by design: a lost message is recovered by the retry
    // cadence, a dead relay by the step deadline.
    if let Err(e) = ctx.relay.send(to, message.encode()).await {
        warn!(%to, %e, "trade message not sent");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::machine::ExchangePhase;
    use crate::money::Currency;
    use crate::payment::{AccountId, InMemoryPaymentHub};
    use crate::relay::client::{RelayClient, RelayClientConfig, RelayEvent};
    use crate::relay::server::RelayServer;
    use crate::wallet::InMemoryWallet;

    fn fresh_id() -> OverlayId {
        OverlayId::from_public_key(&TradeKeypair::generate().public_key())
    }

    async fn start_relay() -> std::net::SocketAddr {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());
        addr
    }

    fn fast_client(addr: std::net::SocketAddr, id: OverlayId) -> RelayClientConfig {
        RelayClientConfig {
            connect_addr: addr.to_string(),
            local_id: id,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    /// Pumps a peer's relay events into its runner handle.
    fn pump(mut events: mpsc::Receiver<RelayEvent>, handle: ExchangeRunnerHandle) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let RelayEvent::Message { payload, .. } = event {
                    if let Ok(message) = TradeMessage::decode(&payload) {
                        handle.deliver(message);
                    }
                }
            }
        });
    }

    struct PeerSetup {
        ctx: ExchangeContext,
        events: mpsc::Receiver<RelayEvent>,
        wallet: Arc<InMemoryWallet>,
    }

    async fn peer(
        addr: std::net::SocketAddr,
        id: OverlayId,
        hub: &Arc<InMemoryPaymentHub>,
        account: &str,
        fiat: FiatAmount,
        btc: BitcoinAmount,
    ) -> PeerSetup {
        let (relay, mut events) = RelayClient::start(fast_client(addr, id));
        // Wait until joined so no trade message is sent into the void.
        loop {
            if let Some(RelayEvent::Connected { .. }) = events.recv().await {
                break;
            }
        }
        let wallet = InMemoryWallet::new(btc);
        let payment = hub.open_account(account, fiat);
        let ctx = ExchangeContext {
            local_id: id,
            wallet: wallet.clone(),
            payment,
            relay,
            handshake_timeout: Duration::from_secs(5),
            step_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
        };
        PeerSetup {
            ctx,
            events,
            wallet,
        }
    }

    fn params(
        exchange_id: ExchangeId,
        role: ExchangeRole,
        counterpart: OverlayId,
        steps: u32,
    ) -> ExchangeParams {
        ExchangeParams {
            exchange_id,
            role,
            step_count: steps,
            bitcoin_amount: BitcoinAmount::from_btc(1),
            fiat_amount: FiatAmount::from_major(100, Currency::Eur),
            counterpart,
        }
    }

    async fn await_terminal(
        events: &mut mpsc::UnboundedReceiver<(ExchangeId, ExchangeEvent)>,
    ) -> ExchangeEvent {
        loop {
            let (_, event) = events.recv().await.expect("runner reports a terminal");
            match event {
                ExchangeEvent::Progress(_) => continue,
                terminal => return terminal,
            }
        }
    }

    #[tokio::test]
    async fn full_exchange_succeeds() {
        let addr = start_relay().await;
        let hub = InMemoryPaymentHub::new();
        let buyer_id = fresh_id();
        let seller_id = fresh_id();
        let exchange_id = ExchangeId::random();

        let buyer = peer(
            addr,
            buyer_id,
            &hub,
            "buyer",
            FiatAmount::from_major(500, Currency::Eur),
            BitcoinAmount::from_btc(1),
        )
        .await;
        let seller = peer(
            addr,
            seller_id,
            &hub,
            "seller",
            FiatAmount::zero(Currency::Eur),
            BitcoinAmount::from_btc(2),
        )
        .await;

        let (buyer_events_tx, mut buyer_events) = mpsc::unbounded_channel();
        let (seller_events_tx, mut seller_events) = mpsc::unbounded_channel();

        let buyer_handle = ExchangeRunner::spawn(
            params(exchange_id, ExchangeRole::Buyer, seller_id, 4),
            buyer.ctx.clone(),
            buyer_events_tx,
        );
        let seller_handle = ExchangeRunner::spawn(
            params(exchange_id, ExchangeRole::Seller, buyer_id, 4),
            seller.ctx.clone(),
            seller_events_tx,
        );
        pump(buyer.events, buyer_handle);
        pump(seller.events, seller_handle);

        let buyer_end = await_terminal(&mut buyer_events).await;
        let seller_end = await_terminal(&mut seller_events).await;

        let ExchangeEvent::Success(buyer_snapshot) = buyer_end else {
            panic!("buyer should succeed, got {buyer_end:?}");
        };
        let ExchangeEvent::Success(seller_snapshot) = seller_end else {
            panic!("seller should succeed, got {seller_end:?}");
        };
        assert_eq!(buyer_snapshot.steps_completed, 4);
        assert_eq!(seller_snapshot.steps_completed, 4);

        // Every cent of the trade moved buyer → seller.
        assert_eq!(
            buyer.ctx.payment.available(Currency::Eur).await,
            FiatAmount::from_major(400, Currency::Eur)
        );
        assert_eq!(
            seller.ctx.payment.available(Currency::Eur).await,
            FiatAmount::from_major(100, Currency::Eur)
        );
        // The seller's deposit left its wallet.
        assert_eq!(seller.wallet.available().await, BitcoinAmount::from_btc(1));
    }

    #[tokio::test]
    async fn silent_counterpart_times_out_and_rejects_to_broker() {
        let addr = start_relay().await;
        let hub = InMemoryPaymentHub::new();
        let buyer_id = fresh_id();
        let ghost_id = fresh_id();
        let exchange_id = ExchangeId::random();

        // A broker client watches for the rejection.
        let (_broker_handle, mut broker_events) =
            RelayClient::start(fast_client(addr, BROKER_ID));

        let buyer = peer(
            addr,
            buyer_id,
            &hub,
            "buyer",
            FiatAmount::from_major(100, Currency::Eur),
            BitcoinAmount::from_btc(1),
        )
        .await;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut short_ctx = buyer.ctx.clone();
        short_ctx.handshake_timeout = Duration::from_millis(200);
        let handle = ExchangeRunner::spawn(
            params(exchange_id, ExchangeRole::Buyer, ghost_id, 4),
            short_ctx,
            events_tx,
        );
        pump(buyer.events, handle);

        let end = await_terminal(&mut events).await;
        let ExchangeEvent::Failure { cause, snapshot } = end else {
            panic!("expected failure, got {end:?}");
        };
        assert_eq!(cause, ExchangeError::HandshakeTimeout);
        // A handshake timeout falls back to Failed, never Aborted.
        assert!(matches!(snapshot.phase, ExchangePhase::Failed { .. }));

        // The broker received the ExchangeRejection.
        loop {
            match broker_events.recv().await.expect("broker stays connected") {
                RelayEvent::Message { payload, .. } => {
                    let message = BrokerMessage::decode(&payload).unwrap();
                    let BrokerMessage::Rejection(rejection) = message else {
                        continue;
                    };
                    assert_eq!(rejection.exchange_id, exchange_id);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn funded_handshake_timeout_fails_and_refunds() {
        let addr = start_relay().await;
        let hub = InMemoryPaymentHub::new();
        let buyer_id = fresh_id();
        let mute_id = fresh_id();
        let exchange_id = ExchangeId::random();

        let buyer = peer(
            addr,
            buyer_id,
            &hub,
            "buyer",
            FiatAmount::from_major(100, Currency::Eur),
            BitcoinAmount::from_btc(1),
        )
        .await;

        // A counterpart that answers the handshake announcement and then
        // goes mute: the buyer funds its deposit and must fall back to
        // Failed with the time-locked refund, not Aborted. One identity,
        // announced identically on every retransmission.
        let (mute_relay, mut mute_events) = RelayClient::start(fast_client(addr, mute_id));
        let mute_info = PeerInfo {
            account_id: AccountId::new("mute"),
            public_key: TradeKeypair::generate().public_key(),
        };
        tokio::spawn(async move {
            while let Some(event) = mute_events.recv().await {
                let RelayEvent::Message { from, payload } = event else {
                    continue;
                };
                if let Ok(TradeMessage::Handshake { exchange_id, .. }) =
                    TradeMessage::decode(&payload)
                {
                    let reply = TradeMessage::Handshake {
                        exchange_id,
                        info: mute_info.clone(),
                    };
                    let _ = mute_relay.send(from, reply.encode()).await;
                }
            }
        });

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut short_ctx = buyer.ctx.clone();
        short_ctx.handshake_timeout = Duration::from_millis(400);
        let handle = ExchangeRunner::spawn(
            params(exchange_id, ExchangeRole::Buyer, mute_id, 4),
            short_ctx,
            events_tx,
        );
        pump(buyer.events, handle);

        let end = await_terminal(&mut events).await;
        let ExchangeEvent::Failure { cause, snapshot } = end else {
            panic!("expected failure, got {end:?}");
        };
        assert_eq!(cause, ExchangeError::HandshakeTimeout);
        assert!(matches!(snapshot.phase, ExchangePhase::Failed { .. }));

        // The bond went out as a deposit and came back through the
        // refund before the terminal event was reported.
        assert_eq!(buyer.wallet.available().await, BitcoinAmount::from_btc(1));
    }

    #[tokio::test]
    async fn cancel_is_observed_at_step_boundary() {
        let addr = start_relay().await;
        let hub = InMemoryPaymentHub::new();
        let buyer_id = fresh_id();
        let seller_id = fresh_id();
        let exchange_id = ExchangeId::random();

        let buyer = peer(
            addr,
            buyer_id,
            &hub,
            "buyer",
            FiatAmount::from_major(500, Currency::Eur),
            BitcoinAmount::from_btc(1),
        )
        .await;
        let seller = peer(
            addr,
            seller_id,
            &hub,
            "seller",
            FiatAmount::zero(Currency::Eur),
            BitcoinAmount::from_btc(2),
        )
        .await;

        let (buyer_events_tx, mut buyer_events) = mpsc::unbounded_channel();
        let (seller_events_tx, mut seller_events) = mpsc::unbounded_channel();

        let buyer_handle = ExchangeRunner::spawn(
            params(exchange_id, ExchangeRole::Buyer, seller_id, 4),
            buyer.ctx.clone(),
            buyer_events_tx,
        );
        let seller_handle = ExchangeRunner::spawn(
            params(exchange_id, ExchangeRole::Seller, buyer_id, 4),
            seller.ctx.clone(),
            seller_events_tx,
        );
        // Cancel the buyer before it even starts; the runner observes it
        // at the first step boundary, after the handshake.
        buyer_handle.cancel("user cancelled the order");

        pump(buyer.events, buyer_handle);
        pump(seller.events, seller_handle);

        let buyer_end = await_terminal(&mut buyer_events).await;
        assert!(matches!(
            buyer_end,
            ExchangeEvent::Failure {
                cause: ExchangeError::Cancelled { .. },
                ..
            }
        ));

        // The seller observes the abort.
        let seller_end = await_terminal(&mut seller_events).await;
        assert!(matches!(
            seller_end,
            ExchangeEvent::Failure {
                cause: ExchangeError::CounterpartAbort { .. },
                ..
            }
        ));
    }
}
