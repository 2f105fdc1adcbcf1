//! # Order controller
//!
//! The actor owning one [`Order`] and the runners of its exchanges. It
//! is the only writer of the order's state; everything else — funds
//! events, broker matches, trade messages, exchange progress — arrives
//! through its mailboxes and is handled one message at a time.
//!
//! After every handled message the controller derives what changed and
//! flushes the buffered [`OrderEvent`]s, so subscribers observe a
//! consistent order and events in mutation order. The actor retires
//! itself once the order is terminal and its last exchange has
//! terminated, releasing the blocked funds on the way out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::events::{EventBuffer, OrderEvent};
use super::order::{Order, OrderStatus, Side};
use crate::broker::{BrokerMessage, ExchangeRejection, OrderMatch};
use crate::config::{ExchangeSettings, BUYER_BOND_STEPS, TRADE_RETRY_INTERVAL};
use crate::exchange::{
    runner::ExchangeContext, ExchangeError, ExchangeEvent, ExchangePhase, ExchangeParams,
    ExchangeRole, ExchangeRunner, ExchangeRunnerHandle, ExchangeSnapshot, TradeMessage,
};
use crate::funds::{FundsBlockerHandle, FundsEvent};
use crate::ids::{ExchangeId, OrderId, OverlayId, BROKER_ID};
use crate::money::{fiat_value, FiatAmount};
use crate::payment::PaymentProcessor;
use crate::relay::RelayHandle;
use crate::submission::SubmissionHandle;
use crate::wallet::Wallet;

/// Mailbox capacity of a controller.
const COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Commands, handle, dependencies
// ---------------------------------------------------------------------------

enum OrderCommand {
    Cancel { reason: String },
    Match(OrderMatch),
    Trade(TradeMessage),
}

/// Handle to a controller actor.
#[derive(Clone)]
pub struct OrderControllerHandle {
    order_id: OrderId,
    commands: mpsc::Sender<OrderCommand>,
}

impl OrderControllerHandle {
    /// The order this controller owns.
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// Cancels the order. Non-preemptive towards running exchanges.
    pub async fn cancel(&self, reason: impl Into<String>) {
        let _ = self
            .commands
            .send(OrderCommand::Cancel {
                reason: reason.into(),
            })
            .await;
    }

    /// Feeds a broker match to the controller.
    pub async fn order_match(&self, m: OrderMatch) {
        let _ = self.commands.send(OrderCommand::Match(m)).await;
    }

    /// Routes an inbound trade message to the owning exchange runner.
    pub async fn trade_message(&self, message: TradeMessage) {
        let _ = self.commands.send(OrderCommand::Trade(message)).await;
    }
}

/// Everything a controller needs from its environment.
#[derive(Clone)]
pub struct OrderControllerDeps {
    /// Our overlay id.
    pub local_id: OverlayId,
    /// Process-wide wallet.
    pub wallet: Arc<dyn Wallet>,
    /// Process-wide payment processor.
    pub payment: Arc<dyn PaymentProcessor>,
    /// Relay for broker and counterpart traffic.
    pub relay: RelayHandle,
    /// The funds blocker.
    pub funds: FundsBlockerHandle,
    /// The submission supervisor.
    pub submission: SubmissionHandle,
    /// Exchange protocol options.
    pub exchange: ExchangeSettings,
    /// Session blacklist of misbehaving counterparts, shared across
    /// controllers.
    pub blacklist: Arc<RwLock<HashSet<OverlayId>>>,
    /// Trade retransmission cadence (tunable for tests).
    pub retry_interval: Duration,
    /// Notified exactly once when the controller retires, so the owning
    /// engine can prune its routing tables. Orders are destroyed only
    /// at terminal status with every child exchange terminated.
    pub retired: mpsc::UnboundedSender<OrderId>,
}

impl OrderControllerDeps {
    /// Dependencies with the production retransmission cadence.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: OverlayId,
        wallet: Arc<dyn Wallet>,
        payment: Arc<dyn PaymentProcessor>,
        relay: RelayHandle,
        funds: FundsBlockerHandle,
        submission: SubmissionHandle,
        exchange: ExchangeSettings,
        blacklist: Arc<RwLock<HashSet<OverlayId>>>,
        retired: mpsc::UnboundedSender<OrderId>,
    ) -> Self {
        Self {
            local_id,
            wallet,
            payment,
            relay,
            funds,
            submission,
            exchange,
            blacklist,
            retry_interval: TRADE_RETRY_INTERVAL,
            retired,
        }
    }
}

// ---------------------------------------------------------------------------
// Match decision
// ---------------------------------------------------------------------------

/// Outcome of feeding an `OrderMatch` to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    /// Spawn an exchange.
    Accept,
    /// Report an `ExchangeRejection` with this cause to the broker.
    Reject(String),
    /// The same match was already accepted; log and drop.
    AlreadyAccepted,
}

/// The match acceptance rules, as a pure function so they are testable
/// without spinning up the actor.
pub fn decide_match(
    order: &Order,
    blacklist: &HashSet<OverlayId>,
    m: &OrderMatch,
) -> MatchDecision {
    if m.order_id != order.id() {
        return MatchDecision::Reject("OrderIdMismatch".to_string());
    }
    if order.status().is_terminal() {
        return MatchDecision::Reject("OrderFinished".to_string());
    }
    if m.fiat_amount.currency() != order.price().currency() {
        return MatchDecision::Reject("CurrencyMismatch".to_string());
    }
    if let Some(existing) = order.exchange(&m.exchange_id) {
        return if existing.is_running() {
            MatchDecision::AlreadyAccepted
        } else {
            MatchDecision::Reject("ExchangeAlreadyTerminated".to_string())
        };
    }
    if blacklist.contains(&m.counterpart_id) {
        return MatchDecision::Reject("CounterpartBlacklisted".to_string());
    }
    if order.has_running_exchange_with(&m.counterpart_id) {
        return MatchDecision::Reject("CounterpartBusy".to_string());
    }
    match order.amounts() {
        Ok(amounts) if amounts.pending >= m.bitcoin_amount => MatchDecision::Accept,
        Ok(_) => MatchDecision::Reject("MatchExceedsPending".to_string()),
        Err(_) => MatchDecision::Reject("OrderAmountsInconsistent".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Spawns order controller actors.
pub struct OrderController;

impl OrderController {
    /// Spawns the controller for `order`. Returns its handle and the
    /// order's event stream. The controller immediately asks the funds
    /// blocker for both legs of the trade.
    pub fn spawn(
        order: Order,
        deps: OrderControllerDeps,
    ) -> (OrderControllerHandle, mpsc::UnboundedReceiver<OrderEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = OrderControllerHandle {
            order_id: order.id(),
            commands: commands_tx,
        };
        tokio::spawn(run(order, deps, commands_rx, events_tx));
        (handle, events_rx)
    }
}

struct Controller {
    order: Order,
    deps: OrderControllerDeps,
    funds_ok: bool,
    runners: HashMap<ExchangeId, ExchangeRunnerHandle>,
    buffer: EventBuffer,
    exchange_events: mpsc::UnboundedSender<(ExchangeId, ExchangeEvent)>,
    submitted: mpsc::UnboundedSender<OrderId>,
    // Keeps the funds event channel open even when the blocker drops its
    // sender (failed block, revocation) — a fundless order parks Offline,
    // it does not retire.
    _funds_keepalive: mpsc::UnboundedSender<FundsEvent>,
}

async fn run(
    order: Order,
    deps: OrderControllerDeps,
    mut commands: mpsc::Receiver<OrderCommand>,
    events: mpsc::UnboundedSender<OrderEvent>,
) {
    let order_id = order.id();
    let (funds_tx, mut funds_rx) = mpsc::unbounded_channel();
    let (exchange_tx, mut exchange_rx) = mpsc::unbounded_channel();
    let (submitted_tx, mut submitted_rx) = mpsc::unbounded_channel();

    let mut controller = Controller {
        order,
        deps,
        funds_ok: false,
        runners: HashMap::new(),
        buffer: EventBuffer::new(events),
        exchange_events: exchange_tx,
        submitted: submitted_tx,
        _funds_keepalive: funds_tx.clone(),
    };

    // Admission: nothing goes on the market before both legs are blocked.
    let (fiat, bitcoin) = controller.required_funds();
    controller
        .deps
        .funds
        .block(order_id, fiat, bitcoin, funds_tx)
        .await;

    loop {
        let old_progress = controller.order.progress();
        let old_status = controller.order.status().clone();

        tokio::select! {
            command = commands.recv() => match command {
                Some(OrderCommand::Cancel { reason }) => controller.handle_cancel(reason).await,
                Some(OrderCommand::Match(m)) => controller.handle_match(m).await,
                Some(OrderCommand::Trade(message)) => controller.handle_trade(message),
                None => break,
            },
            event = funds_rx.recv() => match event {
                Some(event) => controller.handle_funds(event).await,
                None => break,
            },
            event = exchange_rx.recv() => match event {
                Some((exchange_id, event)) => {
                    controller.handle_exchange_event(exchange_id, event).await;
                }
                None => break,
            },
            submitted = submitted_rx.recv() => match submitted {
                Some(_) => controller.handle_submitted(),
                None => break,
            },
        }

        controller.emit_changes(old_progress, old_status);

        if controller.order.status().is_terminal() && !controller.order.has_running_exchange() {
            break;
        }
    }

    // Retirement: release whatever is still reserved, leave the book,
    // and tell the engine to forget this order's routing entries.
    controller.deps.submission.stop_submitting(order_id).await;
    controller.deps.funds.unblock(order_id).await;
    let _ = controller.deps.retired.send(order_id);
    info!(%order_id, status = %controller.order.status(), "order controller retired");
}

impl Controller {
    /// What the order must have blocked before going on the market: the
    /// buyer blocks the full fiat value plus the deposit bond, the
    /// seller the full bitcoin amount.
    fn required_funds(&self) -> (FiatAmount, crate::money::BitcoinAmount) {
        match self.order.side() {
            Side::Bid => {
                let fiat = match fiat_value(&self.order.price(), self.order.total()) {
                    Ok(rounded) => rounded.value,
                    Err(e) => {
                        error!(order_id = %self.order.id(), %e, "fiat valuation failed");
                        FiatAmount::zero(self.order.price().currency())
                    }
                };
                let bond = self.order.total().scaled(
                    BUYER_BOND_STEPS.min(self.deps.exchange.step_count),
                    self.deps.exchange.step_count,
                );
                (fiat, bond)
            }
            Side::Ask => (
                FiatAmount::zero(self.order.price().currency()),
                self.order.total(),
            ),
        }
    }

    fn emit_changes(&mut self, old_progress: f64, old_status: OrderStatus) {
        let new_progress = self.order.progress();
        let new_status = self.order.status().clone();

        if new_progress != old_progress {
            self.buffer.push(OrderEvent::Progressed {
                old: old_progress,
                new: new_progress,
            });
        }
        if new_status != old_status {
            self.buffer.push(OrderEvent::StatusChanged {
                old: old_status,
                new: new_status.clone(),
            });
        }
        if new_status.is_terminal() && !self.buffer.is_finished() {
            self.buffer.push(OrderEvent::Finished { status: new_status });
        }
        self.buffer.flush();
    }

    async fn handle_funds(&mut self, event: FundsEvent) {
        match event {
            FundsEvent::Available { .. } => {
                self.funds_ok = true;
                if self.order.should_be_on_market() {
                    self.order.set_status(OrderStatus::InMarket);
                    self.submit_entry().await;
                }
            }
            FundsEvent::Unavailable { .. } => {
                self.funds_ok = false;
                if !self.order.status().is_terminal() {
                    self.order.set_status(OrderStatus::Offline);
                    self.deps.submission.stop_submitting(self.order.id()).await;
                }
            }
        }
    }

    async fn submit_entry(&mut self) {
        match self.order.book_entry() {
            Ok(entry) => {
                self.deps
                    .submission
                    .keep_submitting(entry, self.submitted.clone())
                    .await;
            }
            Err(violation) => {
                error!(%violation, "cannot derive book entry, parking order offline");
                self.order.set_status(OrderStatus::Offline);
            }
        }
    }

    fn handle_submitted(&mut self) {
        if let Ok(entry) = self.order.book_entry() {
            self.buffer.push(OrderEvent::Submitted { entry });
        }
    }

    async fn handle_cancel(&mut self, reason: String) {
        if self.order.status().is_terminal() {
            debug!(order_id = %self.order.id(), "cancel on finished order ignored");
            return;
        }
        info!(order_id = %self.order.id(), %reason, "order cancelled");
        self.order
            .set_status(OrderStatus::Cancelled { reason: reason.clone() });
        self.deps.submission.stop_submitting(self.order.id()).await;
        // Running exchanges observe the cancel at their next step
        // boundary; the controller retires once they report terminal.
        for runner in self.runners.values() {
            runner.cancel(reason.clone());
        }
    }

    async fn handle_match(&mut self, m: OrderMatch) {
        let decision = {
            let blacklist = self.deps.blacklist.read();
            decide_match(&self.order, &blacklist, &m)
        };
        match decision {
            MatchDecision::Accept => self.accept_match(m).await,
            MatchDecision::AlreadyAccepted => {
                debug!(exchange_id = %m.exchange_id, "match already accepted");
            }
            MatchDecision::Reject(cause) => {
                info!(exchange_id = %m.exchange_id, %cause, "match rejected");
                let rejection = BrokerMessage::Rejection(ExchangeRejection {
                    exchange_id: m.exchange_id,
                    cause,
                });
                if let Err(e) = self.deps.relay.send(BROKER_ID, rejection.encode()).await {
                    warn!(%e, "could not report match rejection to broker");
                }
            }
        }
    }

    async fn accept_match(&mut self, m: OrderMatch) {
        let role = match self.order.side() {
            Side::Bid => ExchangeRole::Buyer,
            Side::Ask => ExchangeRole::Seller,
        };
        let params = ExchangeParams {
            exchange_id: m.exchange_id,
            role,
            // N >= 1 is a construction invariant of an exchange; settings
            // are validated at startup, this guards embedders that skip it.
            step_count: self.deps.exchange.step_count.max(1),
            bitcoin_amount: m.bitcoin_amount,
            fiat_amount: m.fiat_amount,
            counterpart: m.counterpart_id,
        };

        // The snapshot exists from the moment of acceptance so the order
        // stops looking available before the runner's first report.
        self.order.add_exchange(ExchangeSnapshot {
            exchange_id: params.exchange_id,
            role,
            counterpart: params.counterpart,
            bitcoin_amount: params.bitcoin_amount,
            fiat_amount: params.fiat_amount,
            step_count: params.step_count,
            steps_completed: 0,
            phase: ExchangePhase::NonStarted,
        });

        let ctx = ExchangeContext {
            local_id: self.deps.local_id,
            wallet: self.deps.wallet.clone(),
            payment: self.deps.payment.clone(),
            relay: self.deps.relay.clone(),
            handshake_timeout: self.deps.exchange.handshake_timeout(),
            step_timeout: self.deps.exchange.step_timeout(),
            retry_interval: self.deps.retry_interval,
        };
        let runner = ExchangeRunner::spawn(params, ctx, self.exchange_events.clone());
        info!(order_id = %self.order.id(), exchange_id = %m.exchange_id, %role, "match accepted");
        self.runners.insert(m.exchange_id, runner);

        self.order.set_status(OrderStatus::InProgress);
        self.deps.submission.stop_submitting(self.order.id()).await;
    }

    fn handle_trade(&mut self, message: TradeMessage) {
        let exchange_id = message.exchange_id();
        match self.runners.get(&exchange_id) {
            Some(runner) => runner.deliver(message),
            None => debug!(%exchange_id, "trade message for unknown exchange dropped"),
        }
    }

    async fn handle_exchange_event(&mut self, exchange_id: ExchangeId, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Progress(snapshot) => {
                self.order.add_exchange(snapshot);
            }
            ExchangeEvent::Success(snapshot) => {
                info!(%exchange_id, "exchange completed");
                self.order.add_exchange(snapshot);
                self.runners.remove(&exchange_id);
                self.after_exchange_terminal().await;
            }
            ExchangeEvent::Failure { snapshot, cause } => {
                warn!(%exchange_id, %cause, "exchange failed");
                if let ExchangeError::ProtocolViolation { .. } = cause {
                    self.deps.blacklist.write().insert(snapshot.counterpart);
                }
                self.order.add_exchange(snapshot);
                self.runners.remove(&exchange_id);
                self.after_exchange_terminal().await;
            }
        }
    }

    /// Re-derives the order's fate after an exchange reached a terminal
    /// phase: complete it, put it back on the market, or park it.
    async fn after_exchange_terminal(&mut self) {
        if self.order.status().is_terminal() {
            return; // cancelled while the exchange was finishing
        }
        if self.order.is_complete() {
            self.order.set_status(OrderStatus::Completed);
            return;
        }
        if self.order.should_be_on_market() && self.funds_ok {
            self.order.set_status(OrderStatus::InMarket);
            self.submit_entry().await;
        } else if !self.funds_ok {
            self.order.set_status(OrderStatus::Offline);
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
    use crate::exchange::ExchangePhase;
    use crate::money::{BitcoinAmount, Currency};

    fn eur_per_btc(major: u64) -> FiatAmount {
        FiatAmount::from_major(major, Currency::Eur)
    }

    fn fresh_id() -> OverlayId {
        OverlayId::from_public_key(&TradeKeypair::generate().public_key())
    }

    fn order(total_btc: u64) -> Order {
        Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(total_btc),
            eur_per_btc(10),
        )
    }

    fn matching(order: &Order, btc: u64) -> OrderMatch {
        OrderMatch {
            order_id: order.id(),
            exchange_id: ExchangeId::random(),
            counterpart_id: fresh_id(),
            bitcoin_amount: BitcoinAmount::from_btc(btc),
            fiat_amount: FiatAmount::from_major(btc * 10, Currency::Eur),
        }
    }

    #[test]
    fn valid_match_is_accepted() {
        let order = order(10);
        let m = matching(&order, 5);
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::Accept
        );
    }

    #[test]
    fn wrong_order_id_rejected() {
        let order = order(10);
        let mut m = matching(&order, 5);
        m.order_id = OrderId::random();
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::Reject("OrderIdMismatch".to_string())
        );
    }

    #[test]
    fn currency_mismatch_rejected() {
        let order = order(10);
        let mut m = matching(&order, 5);
        m.fiat_amount = FiatAmount::from_major(50, Currency::Usd);
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::Reject("CurrencyMismatch".to_string())
        );
    }

    #[test]
    fn match_exceeding_pending_rejected() {
        let order = order(10);
        let m = matching(&order, 11);
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::Reject("MatchExceedsPending".to_string())
        );
    }

    #[test]
    fn busy_counterpart_rejected() {
        let mut order = order(20);
        let counterpart = fresh_id();
        order.add_exchange(ExchangeSnapshot {
            exchange_id: ExchangeId::random(),
            role: ExchangeRole::Buyer,
            counterpart,
            bitcoin_amount: BitcoinAmount::from_btc(5),
            fiat_amount: FiatAmount::from_major(50, Currency::Eur),
            step_count: 10,
            steps_completed: 0,
            phase: ExchangePhase::Handshaking,
        });

        let mut m = matching(&order, 5);
        m.counterpart_id = counterpart;
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::Reject("CounterpartBusy".to_string())
        );
    }

    #[test]
    fn duplicate_running_exchange_is_already_accepted() {
        let mut order = order(20);
        let m = matching(&order, 5);
        order.add_exchange(ExchangeSnapshot {
            exchange_id: m.exchange_id,
            role: ExchangeRole::Buyer,
            counterpart: m.counterpart_id,
            bitcoin_amount: m.bitcoin_amount,
            fiat_amount: m.fiat_amount,
            step_count: 10,
            steps_completed: 2,
            phase: ExchangePhase::Exchanging { steps_completed: 2 },
        });
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::AlreadyAccepted
        );
    }

    #[test]
    fn terminated_exchange_id_cannot_be_reused() {
        let mut order = order(20);
        let m = matching(&order, 5);
        order.add_exchange(ExchangeSnapshot {
            exchange_id: m.exchange_id,
            role: ExchangeRole::Buyer,
            counterpart: m.counterpart_id,
            bitcoin_amount: m.bitcoin_amount,
            fiat_amount: m.fiat_amount,
            step_count: 10,
            steps_completed: 3,
            phase: ExchangePhase::Failed {
                cause: "step timeout".to_string(),
            },
        });
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::Reject("ExchangeAlreadyTerminated".to_string())
        );
    }

    #[test]
    fn blacklisted_counterpart_rejected() {
        let order = order(10);
        let m = matching(&order, 5);
        let mut blacklist = HashSet::new();
        blacklist.insert(m.counterpart_id);
        assert_eq!(
            decide_match(&order, &blacklist, &m),
            MatchDecision::Reject("CounterpartBlacklisted".to_string())
        );
    }

    #[test]
    fn finished_order_rejects_matches() {
        let mut order = order(10);
        order.set_status(OrderStatus::Cancelled {
            reason: "user".to_string(),
        });
        let m = matching(&order, 5);
        assert_eq!(
            decide_match(&order, &HashSet::new(), &m),
            MatchDecision::Reject("OrderFinished".to_string())
        );
    }
}
