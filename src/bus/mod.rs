//! Event bus module
//!
//! Topic-addressed publish/subscribe fanout. Each connection owns a bounded
//! [`DeliveryQueue`]; publishers never wait on consumers.

mod queue;
mod registry;

pub use queue::{DeliveryQueue, PushOutcome};
pub use registry::{ConnectionSubscriptions, SubscriptionRegistry};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Feed};
use crate::error::{CoreError, Result};
use crate::metrics;

/// Stable identifier of a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle given to the transport for one attached connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub queue: Arc<DeliveryQueue>,
}

/// Publish/subscribe fanout over per-connection delivery queues
#[derive(Debug)]
pub struct EventBus {
    registry: RwLock<SubscriptionRegistry>,
    connections: DashMap<ConnectionId, Arc<DeliveryQueue>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            registry: RwLock::new(SubscriptionRegistry::new()),
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Attach a new connection with an empty subscription set
    pub fn connect(&self) -> Connection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(DeliveryQueue::new(self.queue_capacity));
        self.connections.insert(id, queue.clone());
        metrics::ACTIVE_CONNECTIONS.inc();
        info!(connection = %id, "Connection attached");
        Connection { id, queue }
    }

    /// Subscribe to `symbols` on `feed` (`None` = every symbol)
    pub fn subscribe(&self, connection: ConnectionId, feed: Feed, symbols: Option<&[String]>) -> Result<usize> {
        if !self.connections.contains_key(&connection) {
            return Err(CoreError::ConnectionNotFound(connection));
        }
        let added = self.registry.write().add(connection, feed, symbols);
        debug!(connection = %connection, feed = %feed, ?symbols, added, "Subscribed");
        Ok(added)
    }

    /// Remove subscriptions; absent pairs are ignored
    pub fn unsubscribe(&self, connection: ConnectionId, feed: Feed, symbols: Option<&[String]>) -> usize {
        let removed = self.registry.write().remove(connection, feed, symbols);
        debug!(connection = %connection, feed = %feed, ?symbols, removed, "Unsubscribed");
        removed
    }

    /// Detach a connection and all of its subscriptions in one step
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        self.registry.write().remove_connection(connection);
        match self.connections.remove(&connection) {
            Some((_, queue)) => {
                queue.close();
                metrics::ACTIVE_CONNECTIONS.dec();
                info!(connection = %connection, "Connection detached");
                true
            }
            None => false,
        }
    }

    /// Enqueue `envelope` for every connection subscribed to `(feed, key)` or
    /// to the whole feed. Returns how many queues accepted it. No subscribers
    /// is not an error.
    pub fn publish(&self, feed: Feed, key: &str, envelope: Envelope) -> usize {
        let subscribers = self.registry.read().subscribers(feed, key);
        if subscribers.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut overflowed = Vec::new();

        for connection in subscribers {
            let Some(queue) = self.connections.get(&connection).map(|q| q.value().clone()) else {
                continue;
            };
            match queue.push(Some(feed), envelope.clone()) {
                PushOutcome::Queued | PushOutcome::Coalesced | PushOutcome::Evicted => {
                    delivered += 1
                }
                PushOutcome::Overflow => overflowed.push(connection),
                PushOutcome::Dropped | PushOutcome::Closed => {}
            }
        }

        if delivered > 0 {
            metrics::ENVELOPES_PUBLISHED
                .with_label_values(&[feed.as_str()])
                .inc_by(delivered as u64);
        }

        for connection in overflowed {
            warn!(
                connection = %connection,
                feed = %feed,
                kind = envelope.kind(),
                "Delivery queue overflow on reliable feed, disconnecting slow consumer"
            );
            metrics::SLOW_CONSUMER_DISCONNECTS.inc();
            self.disconnect(connection);
        }

        delivered
    }

    /// Deliver to a single connection regardless of subscriptions
    pub fn send_to(&self, connection: ConnectionId, envelope: Envelope) -> Result<PushOutcome> {
        let queue = self
            .connections
            .get(&connection)
            .map(|q| q.value().clone())
            .ok_or(CoreError::ConnectionNotFound(connection))?;

        let outcome = queue.push(None, envelope);
        if outcome == PushOutcome::Overflow {
            warn!(connection = %connection, "Delivery queue overflow on direct send, disconnecting");
            metrics::SLOW_CONSUMER_DISCONNECTS.inc();
            self.disconnect(connection);
        }
        Ok(outcome)
    }

    /// Deliver to every attached connection
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        let targets: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        targets
            .into_iter()
            .filter(|connection| {
                matches!(
                    self.send_to(*connection, envelope.clone()),
                    Ok(PushOutcome::Queued | PushOutcome::Coalesced | PushOutcome::Evicted)
                )
            })
            .count()
    }

    pub fn is_subscribed(&self, connection: ConnectionId, feed: Feed, key: &str) -> bool {
        self.registry.read().is_subscribed(connection, feed, key)
    }

    /// Copy of a connection's subscription set
    pub fn subscriptions(&self, connection: ConnectionId) -> Option<ConnectionSubscriptions> {
        self.registry.read().subscriptions(connection).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
