//! Background reconciliation of orders whose exchange state is unknown

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use super::router::OrderRouter;

pub struct Reconciler {
    router: Arc<OrderRouter>,
    every: Duration,
}

impl Reconciler {
    pub fn new(router: Arc<OrderRouter>, every: Duration) -> Self {
        Self { router, every }
    }

    /// Resolve leftovers from a previous run, then query parked orders on
    /// every tick, evicting settled orders as they age out
    pub async fn run(self) {
        let pending = self.router.reconcile_pending().await;
        info!(
            pending,
            interval_secs = self.every.as_secs(),
            "Order reconciliation started"
        );

        let mut ticker = interval(self.every);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let parked = self.router.parked_count();
            if parked > 0 {
                let settled = self.router.reconcile_parked().await;
                debug!(parked, settled, "Reconciliation pass complete");
            }

            let evicted = self.router.evict_settled();
            if evicted > 0 {
                info!(evicted, "Evicted settled orders");
            }
        }
    }
}
