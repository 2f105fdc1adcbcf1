//! # Order model
//!
//! The pure, synchronous heart of an order: a fixed identity and total,
//! a map of exchange snapshots, and everything derived from them —
//! amounts, progress, completion, and the `should_be_on_market`
//! predicate the submission supervisor keys off.
//!
//! Derivation rules:
//!
//! - `exchanged`  = Σ amount of successful exchanges
//! - `exchanging` = Σ amount of running (non-terminal) exchanges
//! - `pending`    = `total − exchanged − exchanging`
//! - `progress`   = `(exchanged + Σ steps/N · amount(running)) / total`
//!
//! which keeps `exchanged + exchanging + pending = total` at all times.
//! A failed exchange is neither successful nor running: its amount falls
//! back into `pending`, and progress drops by exactly its contribution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::broker::OrderBookEntry;
use crate::exchange::ExchangeSnapshot;
use crate::ids::{ExchangeId, OrderId};
use crate::money::{BitcoinAmount, FiatAmount};

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Trade direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Buy bitcoin for fiat.
    Bid,
    /// Sell bitcoin for fiat.
    Ask,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bid => f.write_str("bid"),
            Self::Ask => f.write_str("ask"),
        }
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created, funds not yet blocked.
    NotStarted,
    /// Funds blocked and the entry is being kept in the broker's book.
    InMarket,
    /// Funds unavailable; withdrawn from the book until they return.
    Offline,
    /// At least one exchange is running.
    InProgress,
    /// Terminal: the whole amount has been exchanged.
    Completed,
    /// Terminal: cancelled by the user.
    Cancelled {
        /// The stated reason.
        reason: String,
    },
}

impl OrderStatus {
    /// Terminal orders accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled { .. })
    }

    /// Short status name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::InMarket => "in-market",
            Self::Offline => "offline",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled { reason } => write!(f, "cancelled ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// The derived decomposition of an order's total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderAmounts {
    /// Irrevocably exchanged by successful exchanges.
    pub exchanged: BitcoinAmount,
    /// Committed to currently running exchanges.
    pub exchanging: BitcoinAmount,
    /// Not yet matched; what the broker may still match against.
    pub pending: BitcoinAmount,
}

/// The exchange snapshots sum to more than the order total. Means a bug
/// in match acceptance; the controller parks the order `Offline` instead
/// of propagating garbage amounts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("order {order_id} invariant violated: exchange amounts exceed the total")]
pub struct OrderInvariantViolation {
    /// The affected order.
    pub order_id: OrderId,
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A user's standing intent to trade `total` bitcoin at `price`.
///
/// Exchange snapshots are keyed by [`ExchangeId`]; re-adding a snapshot
/// under an existing id **overwrites** it in place — monotone progress
/// is the caller's obligation.
#[derive(Debug, Clone)]
pub struct Order {
    id: OrderId,
    side: Side,
    total: BitcoinAmount,
    price: FiatAmount,
    exchanges: HashMap<ExchangeId, ExchangeSnapshot>,
    status: OrderStatus,
}

impl Order {
    /// Creates a fresh order in `NotStarted`.
    pub fn new(id: OrderId, side: Side, total: BitcoinAmount, price: FiatAmount) -> Self {
        Self {
            id,
            side,
            total,
            price,
            exchanges: HashMap::new(),
            status: OrderStatus::NotStarted,
        }
    }

    /// The order id.
    pub fn id(&self) -> OrderId {
        self.id
    }

    /// Trade direction.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Fixed total amount.
    pub fn total(&self) -> BitcoinAmount {
        self.total
    }

    /// Limit price (fiat per whole BTC); its currency is the order's
    /// currency, fixed at creation.
    pub fn price(&self) -> FiatAmount {
        self.price
    }

    /// Current status.
    pub fn status(&self) -> &OrderStatus {
        &self.status
    }

    /// Sets the status. Terminal statuses are sticky: a change away from
    /// them is refused and `false` is returned.
    pub fn set_status(&mut self, status: OrderStatus) -> bool {
        if self.status.is_terminal() && status != self.status {
            return false;
        }
        self.status = status;
        true
    }

    /// A snapshot by exchange id.
    pub fn exchange(&self, id: &ExchangeId) -> Option<&ExchangeSnapshot> {
        self.exchanges.get(id)
    }

    /// All snapshots, no particular order.
    pub fn exchanges(&self) -> impl Iterator<Item = &ExchangeSnapshot> {
        self.exchanges.values()
    }

    /// Records (or overwrites) an exchange snapshot.
    pub fn add_exchange(&mut self, snapshot: ExchangeSnapshot) {
        self.exchanges.insert(snapshot.exchange_id, snapshot);
    }

    /// `true` while any exchange is non-terminal.
    pub fn has_running_exchange(&self) -> bool {
        self.exchanges.values().any(ExchangeSnapshot::is_running)
    }

    /// `true` if a running exchange is already working against
    /// `counterpart` (one exchange per counterpart at a time).
    pub fn has_running_exchange_with(&self, counterpart: &crate::ids::OverlayId) -> bool {
        self.exchanges
            .values()
            .any(|snapshot| snapshot.is_running() && snapshot.counterpart == *counterpart)
    }

    /// Derives the amounts triple.
    pub fn amounts(&self) -> Result<OrderAmounts, OrderInvariantViolation> {
        let violation = || OrderInvariantViolation { order_id: self.id };

        let mut exchanged = BitcoinAmount::zero();
        let mut exchanging = BitcoinAmount::zero();
        for snapshot in self.exchanges.values() {
            if snapshot.is_successful() {
                exchanged = exchanged
                    .checked_add(snapshot.bitcoin_amount)
                    .map_err(|_| violation())?;
            } else if snapshot.is_running() {
                exchanging = exchanging
                    .checked_add(snapshot.bitcoin_amount)
                    .map_err(|_| violation())?;
            }
        }

        let committed = exchanged
            .checked_add(exchanging)
            .map_err(|_| violation())?;
        let pending = self.total.checked_sub(committed).map_err(|_| violation())?;

        Ok(OrderAmounts {
            exchanged,
            exchanging,
            pending,
        })
    }

    /// Progress in `[0, 1]`: completed value plus the committed fraction
    /// of every running exchange, over the total.
    pub fn progress(&self) -> f64 {
        if self.total.is_zero() {
            return 0.0;
        }
        let mut done_sat: u64 = 0;
        for snapshot in self.exchanges.values() {
            if snapshot.is_successful() {
                done_sat = done_sat.saturating_add(snapshot.bitcoin_amount.as_sat());
            } else if snapshot.is_running() {
                done_sat = done_sat.saturating_add(snapshot.completed_amount().as_sat());
            }
        }
        (done_sat as f64 / self.total.as_sat() as f64).clamp(0.0, 1.0)
    }

    /// `true` once the full amount is irrevocably exchanged.
    pub fn is_complete(&self) -> bool {
        match self.amounts() {
            Ok(amounts) => amounts.pending.is_zero() && amounts.exchanging.is_zero(),
            Err(_) => false,
        }
    }

    /// The predicate the submission supervisor keys off: residual
    /// pending amount, nothing running, and the order is not finished.
    pub fn should_be_on_market(&self) -> bool {
        let pending = match self.amounts() {
            Ok(amounts) => amounts.pending,
            Err(_) => return false,
        };
        !pending.is_zero() && !self.has_running_exchange() && !self.status.is_terminal()
    }

    /// The canonical book entry for the broker: the still-pending
    /// amount at the limit price.
    pub fn book_entry(&self) -> Result<OrderBookEntry, OrderInvariantViolation> {
        Ok(OrderBookEntry {
            order_id: self.id,
            side: self.side,
            amount: self.amounts()?.pending,
            price: self.price,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TradeKeypair;
    use crate::exchange::{ExchangePhase, ExchangeRole};
    use crate::ids::OverlayId;
    use crate::money::{fiat_value, Currency};

    fn eur_per_btc(major: u64) -> FiatAmount {
        FiatAmount::from_major(major, Currency::Eur)
    }

    fn fresh_counterpart() -> OverlayId {
        OverlayId::from_public_key(&TradeKeypair::generate().public_key())
    }

    fn snapshot(
        amount: BitcoinAmount,
        steps_completed: u32,
        step_count: u32,
        phase: ExchangePhase,
    ) -> ExchangeSnapshot {
        ExchangeSnapshot {
            exchange_id: ExchangeId::random(),
            role: ExchangeRole::Buyer,
            counterpart: fresh_counterpart(),
            bitcoin_amount: amount,
            fiat_amount: fiat_value(&eur_per_btc(10), amount).unwrap().value,
            step_count,
            steps_completed,
            phase,
        }
    }

    fn running(amount: BitcoinAmount, steps_completed: u32, step_count: u32) -> ExchangeSnapshot {
        snapshot(
            amount,
            steps_completed,
            step_count,
            ExchangePhase::Exchanging { steps_completed },
        )
    }

    fn successful(amount: BitcoinAmount, step_count: u32) -> ExchangeSnapshot {
        snapshot(amount, step_count, step_count, ExchangePhase::Successful)
    }

    #[test]
    fn fresh_order_has_everything_pending() {
        let order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(10),
            eur_per_btc(10),
        );
        assert_eq!(order.progress(), 0.0);
        assert_eq!(
            order.amounts().unwrap(),
            OrderAmounts {
                exchanged: BitcoinAmount::zero(),
                exchanging: BitcoinAmount::zero(),
                pending: BitcoinAmount::from_btc(10),
            }
        );
        assert_eq!(*order.status(), OrderStatus::NotStarted);
        assert!(order.should_be_on_market());
    }

    #[test]
    fn half_completed_exchange_occupies_the_whole_amount() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(10),
            eur_per_btc(10),
        );
        order.add_exchange(running(BitcoinAmount::from_btc(10), 5, 10));

        assert_eq!(order.progress(), 0.5);
        assert_eq!(
            order.amounts().unwrap(),
            OrderAmounts {
                exchanged: BitcoinAmount::zero(),
                exchanging: BitcoinAmount::from_btc(10),
                pending: BitcoinAmount::zero(),
            }
        );
        assert!(!order.should_be_on_market());
    }

    #[test]
    fn overwriting_a_snapshot_advances_progress() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(10),
            eur_per_btc(10),
        );
        let mut exchange = running(BitcoinAmount::from_btc(10), 5, 10);
        order.add_exchange(exchange.clone());
        assert_eq!(order.progress(), 0.5);

        exchange.steps_completed = 6;
        exchange.phase = ExchangePhase::Exchanging { steps_completed: 6 };
        order.add_exchange(exchange);

        assert_eq!(order.progress(), 0.6);
        assert_eq!(order.exchanges().count(), 1, "overwrite, not insert");
    }

    #[test]
    fn mixed_successful_and_running_exchanges() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(20),
            eur_per_btc(10),
        );
        order.add_exchange(successful(BitcoinAmount::from_btc(10), 10));
        order.add_exchange(running(BitcoinAmount::from_btc(10), 5, 10));

        assert_eq!(order.progress(), 0.75);
        assert_eq!(
            order.amounts().unwrap(),
            OrderAmounts {
                exchanged: BitcoinAmount::from_btc(10),
                exchanging: BitcoinAmount::from_btc(10),
                pending: BitcoinAmount::zero(),
            }
        );
        assert!(!order.is_complete());
    }

    #[test]
    fn two_successful_exchanges_complete_the_order() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(20),
            eur_per_btc(1),
        );
        order.add_exchange(successful(BitcoinAmount::from_btc(10), 10));
        order.add_exchange(successful(BitcoinAmount::from_btc(10), 10));

        assert_eq!(order.progress(), 1.0);
        assert!(order.is_complete());
        assert!(!order.should_be_on_market());
    }

    #[test]
    fn failed_exchange_returns_its_amount_to_pending() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(10),
            eur_per_btc(10),
        );
        let mut exchange = running(BitcoinAmount::from_btc(10), 5, 10);
        order.add_exchange(exchange.clone());
        assert_eq!(order.progress(), 0.5);

        exchange.phase = ExchangePhase::Failed {
            cause: "step timeout".to_string(),
        };
        order.add_exchange(exchange);

        // Progress dropped by exactly the failed exchange's contribution.
        assert_eq!(order.progress(), 0.0);
        assert_eq!(
            order.amounts().unwrap().pending,
            BitcoinAmount::from_btc(10)
        );
        assert!(order.should_be_on_market());
    }

    #[test]
    fn amounts_always_sum_to_total() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Ask,
            BitcoinAmount::from_btc(30),
            eur_per_btc(10),
        );
        order.add_exchange(successful(BitcoinAmount::from_btc(10), 10));
        order.add_exchange(running(BitcoinAmount::from_btc(7), 3, 10));

        let amounts = order.amounts().unwrap();
        let sum = amounts
            .exchanged
            .checked_add(amounts.exchanging)
            .unwrap()
            .checked_add(amounts.pending)
            .unwrap();
        assert_eq!(sum, order.total());
    }

    #[test]
    fn over_committed_order_reports_violation() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(10),
            eur_per_btc(10),
        );
        order.add_exchange(running(BitcoinAmount::from_btc(11), 0, 10));
        assert!(order.amounts().is_err());
        assert!(!order.should_be_on_market());
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(1),
            eur_per_btc(10),
        );
        assert!(order.set_status(OrderStatus::Cancelled {
            reason: "user".to_string(),
        }));
        assert!(!order.set_status(OrderStatus::InMarket));
        assert!(matches!(order.status(), OrderStatus::Cancelled { .. }));
    }

    #[test]
    fn running_exchange_blocks_market_presence() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(20),
            eur_per_btc(10),
        );
        order.add_exchange(running(BitcoinAmount::from_btc(10), 0, 10));

        // Half the amount is pending but an exchange is running.
        assert_eq!(
            order.amounts().unwrap().pending,
            BitcoinAmount::from_btc(10)
        );
        assert!(!order.should_be_on_market());
    }

    #[test]
    fn book_entry_carries_the_pending_amount() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Ask,
            BitcoinAmount::from_btc(20),
            eur_per_btc(10),
        );
        order.add_exchange(successful(BitcoinAmount::from_btc(5), 10));

        let entry = order.book_entry().unwrap();
        assert_eq!(entry.amount, BitcoinAmount::from_btc(15));
        assert_eq!(entry.side, Side::Ask);
        assert_eq!(entry.price, eur_per_btc(10));
    }

    #[test]
    fn counterpart_exclusivity_sees_only_running_exchanges() {
        let mut order = Order::new(
            OrderId::random(),
            Side::Bid,
            BitcoinAmount::from_btc(20),
            eur_per_btc(10),
        );
        let counterpart = fresh_counterpart();
        let mut exchange = running(BitcoinAmount::from_btc(10), 0, 10);
        exchange.counterpart = counterpart;
        order.add_exchange(exchange.clone());
        assert!(order.has_running_exchange_with(&counterpart));

        exchange.phase = ExchangePhase::Failed {
            cause: "abort".to_string(),
        };
        order.add_exchange(exchange);
        assert!(!order.has_running_exchange_with(&counterpart));
    }
}
