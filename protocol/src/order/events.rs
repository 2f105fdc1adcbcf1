//! # Order events
//!
//! The outbound event stream of an order. Historically this was a
//! listener interface with callbacks firing inside the mutation; here
//! events are buffered while a message is being handled and flushed at
//! the end of the handling cycle, so a consumer never observes an order
//! mid-mutation and ordering is exactly mutation order.

use tokio::sync::mpsc;

use super::order::OrderStatus;
use crate::broker::OrderBookEntry;

/// What an order tells its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// Progress changed. Emitted only on actual change.
    Progressed {
        /// Previous progress.
        old: f64,
        /// New progress.
        new: f64,
    },
    /// Status changed. Emitted only on actual change.
    StatusChanged {
        /// Previous status.
        old: OrderStatus,
        /// New status.
        new: OrderStatus,
    },
    /// The entry was published to the broker's book.
    Submitted {
        /// The entry as published.
        entry: OrderBookEntry,
    },
    /// Terminal status reached. Emitted exactly once per order, always
    /// last.
    Finished {
        /// The final status.
        status: OrderStatus,
    },
}

/// Buffers events during one message-handling cycle and flushes them in
/// order afterwards. Enforces the `Finished`-exactly-once contract.
pub struct EventBuffer {
    sink: mpsc::UnboundedSender<OrderEvent>,
    pending: Vec<OrderEvent>,
    finished: bool,
}

impl EventBuffer {
    /// Creates a buffer feeding `sink`.
    pub fn new(sink: mpsc::UnboundedSender<OrderEvent>) -> Self {
        Self {
            sink,
            pending: Vec::new(),
            finished: false,
        }
    }

    /// `true` once the terminal event went out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Queues an event for the end of the current handling cycle.
    /// Everything after the terminal event is silently dropped.
    pub fn push(&mut self, event: OrderEvent) {
        if self.finished {
            return;
        }
        if matches!(event, OrderEvent::Finished { .. }) {
            self.finished = true;
        }
        self.pending.push(event);
    }

    /// Flushes the buffered events in order. Send failures mean the
    /// subscriber went away, which is not the order's problem.
    pub fn flush(&mut self) {
        for event in self.pending.drain(..) {
            let _ = self.sink.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_in_push_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = EventBuffer::new(tx);

        buffer.push(OrderEvent::Progressed { old: 0.0, new: 0.5 });
        buffer.push(OrderEvent::StatusChanged {
            old: OrderStatus::InMarket,
            new: OrderStatus::InProgress,
        });
        assert!(rx.try_recv().is_err(), "nothing flows before flush");

        buffer.flush();
        assert!(matches!(
            rx.try_recv().unwrap(),
            OrderEvent::Progressed { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            OrderEvent::StatusChanged { .. }
        ));
    }

    #[test]
    fn finished_fires_exactly_once_and_ends_the_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = EventBuffer::new(tx);

        buffer.push(OrderEvent::Finished {
            status: OrderStatus::Completed,
        });
        buffer.push(OrderEvent::Finished {
            status: OrderStatus::Completed,
        });
        buffer.push(OrderEvent::Progressed { old: 0.9, new: 1.0 });
        buffer.flush();

        assert!(matches!(rx.try_recv().unwrap(), OrderEvent::Finished { .. }));
        assert!(rx.try_recv().is_err());
        assert!(buffer.is_finished());
    }

    #[test]
    fn dropped_subscriber_does_not_break_flush() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut buffer = EventBuffer::new(tx);
        buffer.push(OrderEvent::Progressed { old: 0.0, new: 1.0 });
        buffer.flush(); // must not panic
    }
}
