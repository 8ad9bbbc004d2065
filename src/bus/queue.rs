//! Per-connection bounded delivery queue
//!
//! Overflow policy:
//! - a market data tick supersedes any undelivered tick for the same symbol
//!   that is not newer than it;
//! - when full, the oldest queued market data tick is evicted;
//! - an incoming tick with nothing to evict is dropped;
//! - a reliable envelope (order, strategy, notification, error) with nothing
//!   to evict closes the queue with a final `Error` envelope.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::envelope::{Envelope, Feed};
use crate::metrics;

/// Result of offering an envelope to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after removing a superseded tick for the same symbol
    Coalesced,
    /// Queued after evicting the oldest market data tick
    Evicted,
    /// Incoming tick discarded (queue full of reliable envelopes, or a newer
    /// tick for the symbol is already queued)
    Dropped,
    /// Reliable envelope could not be queued; the queue is now closed
    Overflow,
    /// Queue was already closed
    Closed,
}

#[derive(Debug)]
struct QueuedEnvelope {
    feed: Option<Feed>,
    envelope: Envelope,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueuedEnvelope>,
    closed: bool,
}

/// Bounded FIFO feeding one connection's writer task
#[derive(Debug)]
pub struct DeliveryQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Offer an envelope published on `feed` (`None` for direct messages)
    pub fn push(&self, feed: Option<Feed>, envelope: Envelope) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            Self::offer(&mut state, self.capacity, feed, envelope)
        };

        match outcome {
            PushOutcome::Queued
            | PushOutcome::Coalesced
            | PushOutcome::Evicted
            | PushOutcome::Overflow => self.notify.notify_one(),
            PushOutcome::Dropped | PushOutcome::Closed => {}
        }
        outcome
    }

    fn offer(
        state: &mut QueueState,
        capacity: usize,
        feed: Option<Feed>,
        envelope: Envelope,
    ) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;

        if let Envelope::MarketData(tick) = &envelope {
            let superseded = state.items.iter().position(|queued| {
                matches!(&queued.envelope, Envelope::MarketData(old) if old.symbol == tick.symbol)
            });
            if let Some(pos) = superseded {
                let newer_queued = matches!(
                    &state.items[pos].envelope,
                    Envelope::MarketData(old) if old.timestamp > tick.timestamp
                );
                if newer_queued {
                    trace!(symbol = %tick.symbol, "Older tick dropped, newer one already queued");
                    metrics::ENVELOPES_DROPPED
                        .with_label_values(&[Feed::MarketData.as_str(), "coalesced"])
                        .inc();
                    return PushOutcome::Dropped;
                }
                state.items.remove(pos);
                metrics::ENVELOPES_DROPPED
                    .with_label_values(&[Feed::MarketData.as_str(), "coalesced"])
                    .inc();
                outcome = PushOutcome::Coalesced;
            }
        }

        if state.items.len() >= capacity {
            let oldest_tick = state
                .items
                .iter()
                .position(|queued| queued.envelope.is_droppable());

            match oldest_tick {
                Some(pos) => {
                    state.items.remove(pos);
                    metrics::ENVELOPES_DROPPED
                        .with_label_values(&[Feed::MarketData.as_str(), "evicted"])
                        .inc();
                    outcome = PushOutcome::Evicted;
                }
                None if envelope.is_droppable() => {
                    debug!("Delivery queue full of reliable envelopes, tick dropped");
                    metrics::ENVELOPES_DROPPED
                        .with_label_values(&[Feed::MarketData.as_str(), "evicted"])
                        .inc();
                    return PushOutcome::Dropped;
                }
                None => {
                    state.closed = true;
                    state.items.push_back(QueuedEnvelope {
                        feed: None,
                        envelope: Envelope::error(
                            "slow_consumer",
                            format!(
                                "delivery queue overflow ({} envelopes pending); {} update lost, reconnect and resync",
                                capacity,
                                envelope.kind()
                            ),
                        ),
                    });
                    return PushOutcome::Overflow;
                }
            }
        }

        state.items.push_back(QueuedEnvelope { feed, envelope });
        outcome
    }

    /// Wait for the next envelope; `None` once the queue is closed and drained
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(queued) = state.items.pop_front() {
                    return Some(queued.envelope);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.state.lock().items.pop_front().map(|queued| queued.envelope)
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<Envelope> {
        self.state
            .lock()
            .items
            .drain(..)
            .map(|queued| queued.envelope)
            .collect()
    }

    /// Stop accepting envelopes; already queued ones remain receivable
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued envelopes per feed, direct messages excluded
    pub fn pending_on(&self, feed: Feed) -> usize {
        self.state
            .lock()
            .items
            .iter()
            .filter(|queued| queued.feed == Some(feed))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{NotificationLevel, OrderUpdate};
    use crate::market::MarketTick;
    use crate::order::OrderStatus;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn tick(symbol: &str, price: rust_decimal::Decimal, age_ms: i64) -> Envelope {
        let mut tick = MarketTick::new(symbol, price, "test");
        tick.timestamp = Utc::now() - Duration::milliseconds(age_ms);
        Envelope::MarketData(tick)
    }

    fn order_update() -> Envelope {
        Envelope::OrderUpdate(OrderUpdate {
            order_id: Uuid::new_v4(),
            client_order_id: None,
            exchange_order_id: None,
            symbol: "BTC/USD".to_string(),
            status: OrderStatus::Submitted,
            filled_quantity: dec!(0),
            average_price: None,
            timestamp: Utc::now(),
        })
    }

    fn price_of(envelope: &Envelope) -> rust_decimal::Decimal {
        match envelope {
            Envelope::MarketData(tick) => tick.price,
            other => panic!("expected market data, got {:?}", other),
        }
    }

    #[test]
    fn test_newer_tick_supersedes_queued_one() {
        let queue = DeliveryQueue::new(8);
        assert_eq!(queue.push(Some(Feed::MarketData), tick("BTC/USD", dec!(100), 20)), PushOutcome::Queued);
        assert_eq!(queue.push(Some(Feed::OrderUpdates), order_update()), PushOutcome::Queued);
        assert_eq!(
            queue.push(Some(Feed::MarketData), tick("BTC/USD", dec!(101), 10)),
            PushOutcome::Coalesced
        );

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], Envelope::OrderUpdate(_)));
        assert_eq!(price_of(&drained[1]), dec!(101));
    }

    #[test]
    fn test_older_tick_does_not_replace_newer() {
        let queue = DeliveryQueue::new(8);
        queue.push(Some(Feed::MarketData), tick("BTC/USD", dec!(101), 0));
        assert_eq!(
            queue.push(Some(Feed::MarketData), tick("BTC/USD", dec!(100), 500)),
            PushOutcome::Dropped
        );
        assert_eq!(price_of(&queue.try_recv().unwrap()), dec!(101));
    }

    #[test]
    fn test_full_queue_evicts_oldest_tick_for_order_update() {
        let queue = DeliveryQueue::new(2);
        queue.push(Some(Feed::MarketData), tick("BTC/USD", dec!(1), 0));
        queue.push(Some(Feed::MarketData), tick("ETH/USD", dec!(2), 0));

        assert_eq!(queue.push(Some(Feed::OrderUpdates), order_update()), PushOutcome::Evicted);
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(price_of(&drained[0]), dec!(2));
        assert!(matches!(drained[1], Envelope::OrderUpdate(_)));
    }

    #[test]
    fn test_tick_dropped_when_only_reliable_envelopes_queued() {
        let queue = DeliveryQueue::new(1);
        queue.push(Some(Feed::OrderUpdates), order_update());
        assert_eq!(
            queue.push(Some(Feed::MarketData), tick("BTC/USD", dec!(1), 0)),
            PushOutcome::Dropped
        );
        assert!(!queue.is_closed());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reliable_overflow_closes_with_error() {
        let queue = DeliveryQueue::new(1);
        queue.push(Some(Feed::OrderUpdates), order_update());
        assert_eq!(queue.push(Some(Feed::OrderUpdates), order_update()), PushOutcome::Overflow);
        assert!(queue.is_closed());
        assert_eq!(
            queue.push(None, Envelope::notification(NotificationLevel::Info, "late")),
            PushOutcome::Closed
        );

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        match &drained[1] {
            Envelope::Error(notice) => assert_eq!(notice.code, "slow_consumer"),
            other => panic!("expected error envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_waits_for_push_and_ends_on_close() {
        let queue = std::sync::Arc::new(DeliveryQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                while let Some(envelope) = queue.recv().await {
                    received.push(envelope);
                }
                received
            })
        };

        queue.push(Some(Feed::OrderUpdates), order_update());
        queue.push(None, Envelope::notification(NotificationLevel::Info, "hello"));
        queue.close();

        let received = consumer.await.unwrap();
        assert_eq!(received.len(), 2);
    }
}
