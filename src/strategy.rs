//! Entry point for scored signals pushed by strategy evaluators

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::envelope::{Envelope, Feed, StrategyUpdate};
use crate::error::{CoreError, Result};

pub struct StrategyPublisher {
    bus: Arc<EventBus>,
    latest: DashMap<String, StrategyUpdate>,
}

impl StrategyPublisher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            latest: DashMap::new(),
        }
    }

    /// Publish `update` on the strategy feed keyed by strategy name.
    /// Returns the number of connections it was delivered to.
    pub fn publish(&self, update: StrategyUpdate) -> Result<usize> {
        if update.strategy.trim().is_empty() {
            return Err(CoreError::InvalidStrategyUpdate(
                "strategy name cannot be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&update.confidence) {
            warn!(strategy = %update.strategy, confidence = update.confidence, "Confidence out of range");
            return Err(CoreError::InvalidStrategyUpdate(format!(
                "confidence {} outside [0, 1]",
                update.confidence
            )));
        }

        self.latest.insert(update.strategy.clone(), update.clone());
        let strategy = update.strategy.clone();
        let delivered = self
            .bus
            .publish(Feed::StrategyUpdates, &strategy, Envelope::StrategyUpdate(update));
        debug!(strategy = %strategy, delivered, "Strategy update published");
        Ok(delivered)
    }

    /// Most recent accepted update of `strategy`
    pub fn latest(&self, strategy: &str) -> Option<StrategyUpdate> {
        self.latest.get(strategy).map(|entry| entry.value().clone())
    }

    pub fn strategies(&self) -> Vec<String> {
        self.latest.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn update(strategy: &str, confidence: f64) -> StrategyUpdate {
        StrategyUpdate {
            strategy: strategy.to_string(),
            confidence,
            expected_profit: dec!(12.5),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_publish_routes_by_strategy_name() {
        let bus = Arc::new(EventBus::new(16));
        let stat_arb = bus.connect();
        let other = bus.connect();
        bus.subscribe(stat_arb.id, Feed::StrategyUpdates, Some(&["stat-arb".to_string()]))
            .unwrap();
        bus.subscribe(other.id, Feed::StrategyUpdates, Some(&["momentum".to_string()]))
            .unwrap();

        let publisher = StrategyPublisher::new(bus);
        assert_eq!(publisher.publish(update("stat-arb", 0.8)).unwrap(), 1);
        assert_eq!(stat_arb.queue.len(), 1);
        assert!(other.queue.is_empty());
        assert_eq!(publisher.latest("stat-arb").unwrap().confidence, 0.8);
    }

    #[test]
    fn test_invalid_updates_rejected() {
        let bus = Arc::new(EventBus::new(16));
        let publisher = StrategyPublisher::new(bus);

        for bad in [update("", 0.5), update("x", 1.5), update("x", -0.1), update("x", f64::NAN)] {
            assert!(matches!(
                publisher.publish(bad),
                Err(CoreError::InvalidStrategyUpdate(_))
            ));
        }
        assert!(publisher.strategies().is_empty());
    }
}
