//! Order router
//!
//! Hands orders to the exchange adapter and feeds the replies back into the
//! state machine. Every adapter call carries a deadline. An expired deadline
//! makes the exchange-side state indeterminate, so the router never re-sends;
//! it asks the venue what happened instead.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::machine::{FillSync, OrderStateMachine};
use super::state::OrderEvent;
use super::{Order, OrderId, OrderStatus};
use crate::adapter::{
    CancelReply, ExchangeAdapter, ExecutionReceiver, ExecutionReport, RemoteOrderState, RemoteStatus,
    SubmitReply,
};
use crate::bus::EventBus;
use crate::config::Config;
use crate::envelope::{Envelope, Feed, NotificationLevel};
use crate::error::{CoreError, Result};
use crate::metrics;

/// Deadlines and retry bounds for adapter calls
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Deadline of every single adapter call
    pub timeout: Duration,
    /// Status queries attempted after a timeout before escalating to `failed`
    pub max_timeouts: u32,
    /// Pause between status queries that found nothing
    pub retry_delay: Duration,
    /// Background queries of a parked order before giving up on it
    pub max_reconcile_attempts: u32,
    /// Age after which terminal orders are evicted from memory
    pub retention: Option<Duration>,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.adapter_timeout(),
            max_timeouts: config.max_adapter_timeouts.max(1),
            retry_delay: config.adapter_timeout() / 4,
            max_reconcile_attempts: config.max_reconcile_attempts,
            retention: config.order_retention(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_timeouts: 3,
            retry_delay: Duration::from_millis(250),
            max_reconcile_attempts: 20,
            retention: Some(Duration::from_secs(3600)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The venue holds the order (it may already be filled or cancelled)
    Accepted(Order),
    Rejected(Order),
    /// Adapter error or unresolved timeout
    Failed(Order),
    /// Repeated submit; nothing was sent
    Suppressed(Order),
}

impl SubmitOutcome {
    pub fn order(&self) -> &Order {
        match self {
            SubmitOutcome::Accepted(order)
            | SubmitOutcome::Rejected(order)
            | SubmitOutcome::Failed(order)
            | SubmitOutcome::Suppressed(order) => order,
        }
    }

    fn from_order(order: Order) -> Self {
        match order.status {
            OrderStatus::Rejected => SubmitOutcome::Rejected(order),
            OrderStatus::Failed => SubmitOutcome::Failed(order),
            OrderStatus::Created | OrderStatus::PendingSubmission => SubmitOutcome::Suppressed(order),
            _ => SubmitOutcome::Accepted(order),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(Order),
    /// The venue refused; the order keeps its status
    Rejected(Order),
    /// A cancellation for this order is already awaiting the venue
    InFlight,
    /// Unresolved timeout escalated to `failed`
    Failed(Order),
}

pub struct OrderRouter {
    machine: Arc<OrderStateMachine>,
    adapter: Arc<dyn ExchangeAdapter>,
    bus: Arc<EventBus>,
    settings: RouterSettings,
    /// Orders forced to `failed` with unknown exchange state, with the number
    /// of background queries made so far
    parked: DashMap<OrderId, u32>,
}

impl OrderRouter {
    pub fn new(
        machine: Arc<OrderStateMachine>,
        adapter: Arc<dyn ExchangeAdapter>,
        bus: Arc<EventBus>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            machine,
            adapter,
            bus,
            settings,
            parked: DashMap::new(),
        }
    }

    pub fn machine(&self) -> &Arc<OrderStateMachine> {
        &self.machine
    }

    /// Send a `created` order to the venue, at most once.
    ///
    /// A repeated call is suppressed; while the first submission is still
    /// unanswered it checks the venue's view of the order instead.
    pub async fn submit(&self, order_id: OrderId) -> Result<SubmitOutcome> {
        let order = match self.machine.begin_submission(order_id)? {
            Some(order) => order,
            None => return self.resend_check(order_id).await,
        };

        info!(order_id = %order.id, symbol = %order.symbol, "Submitting order");
        match timeout(self.settings.timeout, self.adapter.submit(&order)).await {
            Ok(Ok(SubmitReply::Accepted { exchange_order_id })) => {
                let order = self.machine.acknowledge(order.id, Some(exchange_order_id))?;
                Ok(SubmitOutcome::Accepted(order))
            }
            Ok(Ok(SubmitReply::Rejected { reason })) => {
                warn!(order_id = %order.id, reason = %reason, "Order rejected by exchange");
                let order = self.machine.transition(order.id, OrderEvent::SubmitReject { reason })?;
                Ok(SubmitOutcome::Rejected(order))
            }
            Ok(Err(err)) => {
                warn!(order_id = %order.id, error = %err, "Adapter failed on submit");
                let order = self.machine.fail(order.id, &err, false)?;
                Ok(SubmitOutcome::Failed(order))
            }
            Err(_) => {
                metrics::ADAPTER_TIMEOUTS.inc();
                warn!(order_id = %order.id, "Submit timed out, exchange state indeterminate");
                let order = self.resolve_indeterminate(order).await?;
                Ok(SubmitOutcome::from_order(order))
            }
        }
    }

    async fn resend_check(&self, order_id: OrderId) -> Result<SubmitOutcome> {
        let order = self
            .machine
            .get(order_id)
            .ok_or(CoreError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::PendingSubmission {
            debug!(order_id = %order_id, status = %order.status, "Duplicate submit suppressed");
            return Ok(SubmitOutcome::Suppressed(order));
        }

        info!(order_id = %order_id, "Duplicate submit while pending, checking exchange state");
        let order = match timeout(self.settings.timeout, self.adapter.order_status(&order)).await {
            Ok(Ok(state)) if state.status.is_conclusive() => self.apply_remote(order_id, &state)?,
            Ok(Ok(_)) => order,
            Ok(Err(err)) => {
                warn!(order_id = %order_id, error = %err, "Status check failed");
                order
            }
            Err(_) => {
                metrics::ADAPTER_TIMEOUTS.inc();
                order
            }
        };
        Ok(SubmitOutcome::Suppressed(order))
    }

    /// Forward a cancellation if the order is currently cancellable
    pub async fn cancel(&self, order_id: OrderId, reason: &str) -> Result<CancelOutcome> {
        let order = match self.machine.cancel(order_id, reason)? {
            Some(order) => order,
            None => return Ok(CancelOutcome::InFlight),
        };

        match timeout(self.settings.timeout, self.adapter.cancel(&order)).await {
            Ok(Ok(CancelReply::Accepted)) => match self.machine.transition(order_id, OrderEvent::CancelAck) {
                Ok(order) => Ok(CancelOutcome::Cancelled(order)),
                Err(CoreError::IllegalTransition { .. }) => {
                    let order = self.machine.reject_cancel(order_id, "order completed before cancel")?;
                    Ok(CancelOutcome::Rejected(order))
                }
                Err(err) => Err(err),
            },
            Ok(Ok(CancelReply::Rejected { reason })) => {
                info!(order_id = %order_id, reason = %reason, "Cancel rejected by exchange");
                let order = self.machine.reject_cancel(order_id, &reason)?;
                Ok(CancelOutcome::Rejected(order))
            }
            Ok(Err(err)) => {
                warn!(order_id = %order_id, error = %err, "Adapter failed on cancel");
                let order = self.machine.reject_cancel(order_id, &err.to_string())?;
                Ok(CancelOutcome::Rejected(order))
            }
            Err(_) => {
                metrics::ADAPTER_TIMEOUTS.inc();
                warn!(order_id = %order_id, "Cancel timed out, exchange state indeterminate");
                let order = self.resolve_indeterminate(order).await?;
                Ok(match order.status {
                    OrderStatus::Cancelled => CancelOutcome::Cancelled(order),
                    OrderStatus::Failed => CancelOutcome::Failed(order),
                    _ => {
                        let order = self.machine.reject_cancel(order_id, "cancel not confirmed by exchange")?;
                        CancelOutcome::Rejected(order)
                    }
                })
            }
        }
    }

    /// Poll the venue after a timed-out call. Escalates to `failed` with
    /// unknown exchange state when no conclusive answer arrives in time.
    async fn resolve_indeterminate(&self, order: Order) -> Result<Order> {
        for attempt in 1..=self.settings.max_timeouts {
            match timeout(self.settings.timeout, self.adapter.order_status(&order)).await {
                Ok(Ok(state)) if state.status.is_conclusive() => {
                    info!(order_id = %order.id, remote = ?state.status, attempt, "Indeterminate call resolved");
                    return self.apply_remote(order.id, &state);
                }
                Ok(Ok(_)) => {
                    debug!(order_id = %order.id, attempt, "Exchange does not know the order yet");
                }
                Ok(Err(err)) => {
                    warn!(order_id = %order.id, attempt, error = %err, "Status query failed");
                }
                Err(_) => {
                    metrics::ADAPTER_TIMEOUTS.inc();
                    warn!(order_id = %order.id, attempt, "Status query timed out");
                }
            }
            if attempt < self.settings.max_timeouts {
                sleep(self.settings.retry_delay).await;
            }
        }

        self.escalate(order.id)
    }

    fn escalate(&self, order_id: OrderId) -> Result<Order> {
        let cause = CoreError::AdapterTimeout {
            order_id,
            attempts: self.settings.max_timeouts,
        };
        match self.machine.fail(order_id, &cause, true) {
            Ok(order) => {
                self.parked.insert(order_id, 0);
                Ok(order)
            }
            // Reached a terminal status through an execution report meanwhile
            Err(CoreError::IllegalTransition { .. }) => self
                .machine
                .get(order_id)
                .ok_or(CoreError::OrderNotFound(order_id)),
            Err(err) => Err(err),
        }
    }

    /// Bring a live order in line with a conclusive venue answer
    fn apply_remote(&self, order_id: OrderId, state: &RemoteOrderState) -> Result<Order> {
        let order = self
            .machine
            .get(order_id)
            .ok_or(CoreError::OrderNotFound(order_id))?;
        if order.status.is_terminal() {
            return Ok(order);
        }

        match state.status {
            RemoteStatus::NotFound => Ok(order),
            RemoteStatus::Rejected => {
                if order.status != OrderStatus::PendingSubmission {
                    warn!(order_id = %order_id, status = %order.status, "Exchange reports rejected for a live order");
                    return Ok(order);
                }
                self.machine.transition(
                    order_id,
                    OrderEvent::SubmitReject {
                        reason: state
                            .reason
                            .clone()
                            .unwrap_or_else(|| "rejected by exchange".to_string()),
                    },
                )
            }
            RemoteStatus::Open
            | RemoteStatus::PartiallyFilled
            | RemoteStatus::Filled
            | RemoteStatus::Cancelled => {
                let sync = FillSync {
                    exchange_order_id: state.exchange_order_id.clone(),
                    cumulative_quantity: state.filled_quantity,
                    last_price: None,
                    average_price: state.average_price,
                };
                let mut order = self.machine.sync_fills(order_id, &sync)?;

                if state.status == RemoteStatus::Cancelled && !order.status.is_terminal() {
                    order = self.machine.transition(order_id, OrderEvent::CancelAck)?;
                }
                Ok(order)
            }
        }
    }

    /// Apply unsolicited execution reports until the channel closes
    pub async fn run_executions(self: Arc<Self>, mut reports: ExecutionReceiver) {
        info!("Execution report processing started");
        while let Some(report) = reports.recv().await {
            let order_id = report.order_id();
            if let Err(err) = self.apply_execution(report) {
                warn!(order_id = %order_id, error = %err, "Execution report not applied");
            }
        }
        info!("Execution report channel closed");
    }

    pub fn apply_execution(&self, report: ExecutionReport) -> Result<Order> {
        match report {
            ExecutionReport::Fill {
                order_id,
                exchange_order_id,
                quantity,
                cumulative_quantity,
                price,
                ..
            } => {
                debug!(order_id = %order_id, quantity = %quantity, cumulative = %cumulative_quantity, "Fill reported");
                self.machine.sync_fills(
                    order_id,
                    &FillSync {
                        exchange_order_id,
                        cumulative_quantity,
                        last_price: Some(price),
                        average_price: None,
                    },
                )
            }
            ExecutionReport::Cancelled { order_id, reason } => {
                debug!(order_id = %order_id, reason = %reason, "Exchange cancelled order");
                self.machine.transition(order_id, OrderEvent::CancelAck)
            }
        }
    }

    /// Query the venue once for every parked order. Returns how many were
    /// settled.
    pub async fn reconcile_parked(&self) -> usize {
        let parked: Vec<(OrderId, u32)> = self
            .parked
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let mut settled = 0;
        for (order_id, attempts) in parked {
            let Some(order) = self.machine.get(order_id) else {
                self.parked.remove(&order_id);
                continue;
            };

            let state = match timeout(self.settings.timeout, self.adapter.order_status(&order)).await {
                Ok(Ok(state)) => Some(state),
                Ok(Err(err)) => {
                    debug!(order_id = %order_id, error = %err, "Reconciliation query failed");
                    None
                }
                Err(_) => None,
            };

            match state {
                Some(state) if state.status.is_conclusive() => {
                    self.report_discrepancy(&order, &state);
                    self.parked.remove(&order_id);
                    settled += 1;
                }
                _ if attempts + 1 >= self.settings.max_reconcile_attempts => {
                    error!(
                        order_id = %order_id,
                        attempts = attempts + 1,
                        "Exchange state still unknown, giving up reconciliation"
                    );
                    self.parked.remove(&order_id);
                }
                _ => {
                    self.parked.insert(order_id, attempts + 1);
                }
            }
        }
        settled
    }

    fn report_discrepancy(&self, order: &Order, state: &RemoteOrderState) {
        warn!(
            order_id = %order.id,
            local = %order.status,
            remote = ?state.status,
            remote_filled = %state.filled_quantity,
            "Exchange state of failed order resolved"
        );
        let message = format!(
            "order {} is failed locally but the exchange reports {:?} with {} filled",
            order.id, state.status, state.filled_quantity
        );
        self.bus.publish(
            Feed::OrderUpdates,
            &order.symbol,
            Envelope::notification(NotificationLevel::Warning, message),
        );
    }

    /// Resolve orders left in `pending_submission` by a previous run
    pub async fn reconcile_pending(&self) -> usize {
        let pending = self.machine.orders_with_status(OrderStatus::PendingSubmission);
        if !pending.is_empty() {
            info!(count = pending.len(), "Reconciling orders pending submission");
        }

        let count = pending.len();
        for order in pending {
            let order_id = order.id;
            let result = match timeout(self.settings.timeout, self.adapter.order_status(&order)).await {
                Ok(Ok(state)) if state.status.is_conclusive() => self.apply_remote(order_id, &state),
                Ok(Ok(_)) => self.machine.fail(
                    order_id,
                    &CoreError::Adapter("submission never reached the exchange".to_string()),
                    false,
                ),
                Ok(Err(_)) | Err(_) => self.escalate(order_id),
            };
            if let Err(err) = result {
                warn!(order_id = %order_id, error = %err, "Pending order not reconciled");
            }
        }
        count
    }

    /// Drop terminal orders older than the retention window. Parked orders
    /// stay until their reconciliation ends.
    pub fn evict_settled(&self) -> usize {
        let Some(retention) = self.settings.retention else {
            return 0;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = chrono::Utc::now() - retention;
        self.machine
            .evict_terminal(cutoff, |order_id| self.parked.contains_key(&order_id))
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{execution_channel, MockExchangeAdapter};
    use crate::bus::Connection;
    use crate::journal::NullJournal;
    use crate::order::{Direction, OrderRequest};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        machine: Arc<OrderStateMachine>,
        bus: Arc<EventBus>,
        conn: Connection,
    }

    fn harness() -> Harness {
        let bus = Arc::new(EventBus::new(256));
        let conn = bus.connect();
        bus.subscribe(conn.id, Feed::OrderUpdates, None).unwrap();
        let machine = Arc::new(OrderStateMachine::new(bus.clone(), Arc::new(NullJournal), "paper"));
        Harness { machine, bus, conn }
    }

    fn fast_settings() -> RouterSettings {
        RouterSettings {
            timeout: Duration::from_millis(30),
            max_timeouts: 2,
            retry_delay: Duration::from_millis(1),
            max_reconcile_attempts: 2,
            retention: Some(Duration::ZERO),
        }
    }

    fn router(h: &Harness, adapter: impl ExchangeAdapter + 'static) -> OrderRouter {
        OrderRouter::new(h.machine.clone(), Arc::new(adapter), h.bus.clone(), fast_settings())
    }

    fn btc_order(h: &Harness) -> Order {
        h.machine
            .create(OrderRequest::limit("BTC/USD", Direction::Buy, dec!(0.5), dec!(34500.0)))
            .unwrap()
    }

    /// Venue that never answers submit or cancel in time
    struct StallingAdapter {
        remote: Mutex<RemoteOrderState>,
    }

    impl StallingAdapter {
        fn new() -> Self {
            Self {
                remote: Mutex::new(RemoteOrderState::not_found()),
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for Arc<StallingAdapter> {
        async fn submit(&self, _order: &Order) -> Result<SubmitReply> {
            sleep(Duration::from_secs(10)).await;
            Err(CoreError::Adapter("unreachable".to_string()))
        }

        async fn cancel(&self, _order: &Order) -> Result<CancelReply> {
            sleep(Duration::from_secs(10)).await;
            Err(CoreError::Adapter("unreachable".to_string()))
        }

        async fn order_status(&self, _order: &Order) -> Result<RemoteOrderState> {
            Ok(self.remote.lock().clone())
        }
    }

    fn remote(status: RemoteStatus, filled: Decimal, average: Option<Decimal>) -> RemoteOrderState {
        RemoteOrderState {
            status,
            exchange_order_id: Some("EX-42".to_string()),
            filled_quantity: filled,
            average_price: average,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_submit_accepted_once() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().times(1).returning(|_| {
            Ok(SubmitReply::Accepted {
                exchange_order_id: "EX-1".to_string(),
            })
        });
        adapter.expect_order_status().times(0);
        let router = router(&h, adapter);
        let order = btc_order(&h);

        let outcome = router.submit(order.id).await.unwrap();
        assert!(matches!(&outcome, SubmitOutcome::Accepted(o) if o.status == OrderStatus::Submitted));
        assert_eq!(outcome.order().exchange_order_id.as_deref(), Some("EX-1"));

        let again = router.submit(order.id).await.unwrap();
        assert!(matches!(again, SubmitOutcome::Suppressed(_)));
    }

    #[tokio::test]
    async fn test_duplicate_submit_while_pending_checks_status() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().times(0);
        adapter
            .expect_order_status()
            .times(1)
            .returning(|_| Ok(remote(RemoteStatus::Open, dec!(0), None)));
        let router = router(&h, adapter);
        let order = btc_order(&h);

        // First submission still in flight
        h.machine.begin_submission(order.id).unwrap();

        let outcome = router.submit(order.id).await.unwrap();
        match outcome {
            SubmitOutcome::Suppressed(order) => {
                assert_eq!(order.status, OrderStatus::Submitted);
                assert_eq!(order.exchange_order_id.as_deref(), Some("EX-42"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().returning(|_| {
            Ok(SubmitReply::Rejected {
                reason: "insufficient margin".to_string(),
            })
        });
        let router = router(&h, adapter);
        let order = btc_order(&h);

        let outcome = router.submit(order.id).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Rejected(o) if o.status == OrderStatus::Rejected));
    }

    #[tokio::test]
    async fn test_adapter_error_fails_order_with_error_envelope() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter
            .expect_submit()
            .returning(|_| Err(CoreError::Adapter("connection refused".to_string())));
        let router = router(&h, adapter);
        let order = btc_order(&h);
        h.conn.queue.drain();

        let outcome = router.submit(order.id).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Failed(_)));

        let errors: Vec<_> = h
            .conn
            .queue
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Envelope::Error(notice) => Some(notice),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].exchange_state_unknown);
        assert_eq!(router.parked_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_timeout_escalates_and_parks() {
        let h = harness();
        let stalling = Arc::new(StallingAdapter::new());
        let router = router(&h, stalling.clone());
        let order = btc_order(&h);
        h.conn.queue.drain();

        let outcome = router.submit(order.id).await.unwrap();
        assert!(matches!(&outcome, SubmitOutcome::Failed(o) if o.status == OrderStatus::Failed));
        assert_eq!(router.parked_count(), 1);

        let published = h.conn.queue.drain();
        assert!(published
            .iter()
            .any(|e| matches!(e, Envelope::Error(n) if n.exchange_state_unknown && n.code == "adapter_timeout")));

        // The venue turns out to have filled the order
        *stalling.remote.lock() = remote(RemoteStatus::Filled, dec!(0.5), Some(dec!(34500)));
        assert_eq!(router.reconcile_parked().await, 1);
        assert_eq!(router.parked_count(), 0);
        assert_eq!(h.machine.get(order.id).unwrap().status, OrderStatus::Failed);

        let published = h.conn.queue.drain();
        assert!(published.iter().any(|e| matches!(
            e,
            Envelope::Notification(n) if n.level == NotificationLevel::Warning
        )));
    }

    #[tokio::test]
    async fn test_submit_timeout_resolved_by_status() {
        let h = harness();
        let stalling = Arc::new(StallingAdapter::new());
        *stalling.remote.lock() = remote(RemoteStatus::PartiallyFilled, dec!(0.2), Some(dec!(34490)));
        let router = router(&h, stalling);
        let order = btc_order(&h);

        let outcome = router.submit(order.id).await.unwrap();
        let order = outcome.order();
        assert!(matches!(outcome, SubmitOutcome::Accepted(_)));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, dec!(0.2));
        assert_eq!(order.average_fill_price, Some(dec!(34490)));
        assert_eq!(router.parked_count(), 0);
    }

    #[tokio::test]
    async fn test_parked_order_dropped_after_attempts() {
        let h = harness();
        let router = router(&h, Arc::new(StallingAdapter::new()));
        let order = btc_order(&h);
        router.submit(order.id).await.unwrap();
        assert_eq!(router.parked_count(), 1);

        assert_eq!(router.reconcile_parked().await, 0);
        assert_eq!(router.parked_count(), 1);
        assert_eq!(router.reconcile_parked().await, 0);
        assert_eq!(router.parked_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_acked_and_refused_when_filled() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().returning(|_| {
            Ok(SubmitReply::Accepted {
                exchange_order_id: "EX-1".to_string(),
            })
        });
        adapter.expect_cancel().times(1).returning(|_| Ok(CancelReply::Accepted));
        let router = router(&h, adapter);

        let resting = btc_order(&h);
        router.submit(resting.id).await.unwrap();
        let outcome = router.cancel(resting.id, "user request").await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled(o) if o.status == OrderStatus::Cancelled));

        let filled = btc_order(&h);
        router.submit(filled.id).await.unwrap();
        h.machine
            .transition(
                filled.id,
                OrderEvent::Fill {
                    quantity: dec!(0.5),
                    price: dec!(34500),
                },
            )
            .unwrap();
        let err = router.cancel(filled.id, "user request").await.unwrap_err();
        assert!(matches!(err, CoreError::OrderNotCancellable { .. }));
    }

    #[tokio::test]
    async fn test_cancel_rejected_keeps_status() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().returning(|_| {
            Ok(SubmitReply::Accepted {
                exchange_order_id: "EX-1".to_string(),
            })
        });
        adapter.expect_cancel().times(2).returning(|_| {
            Ok(CancelReply::Rejected {
                reason: "too late".to_string(),
            })
        });
        let router = router(&h, adapter);
        let order = btc_order(&h);
        router.submit(order.id).await.unwrap();

        let outcome = router.cancel(order.id, "user").await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Rejected(o) if o.status == OrderStatus::Submitted));
        // A rejected cancellation can be retried
        assert!(matches!(
            router.cancel(order.id, "user").await.unwrap(),
            CancelOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_execution_reports_applied_in_order() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().returning(|_| {
            Ok(SubmitReply::Accepted {
                exchange_order_id: "EX-1".to_string(),
            })
        });
        let router = Arc::new(router(&h, adapter));
        let order = btc_order(&h);
        router.submit(order.id).await.unwrap();

        let (tx, rx) = execution_channel(8);
        let task = tokio::spawn(router.clone().run_executions(rx));
        let executions = [
            (dec!(0.2), dec!(0.2), dec!(34490.0)),
            (dec!(0.3), dec!(0.5), dec!(34495.0)),
        ];
        for (quantity, cumulative_quantity, price) in executions {
            tx.send(ExecutionReport::Fill {
                order_id: order.id,
                exchange_order_id: Some("EX-1".to_string()),
                quantity,
                cumulative_quantity,
                price,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let order = h.machine.get(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.average_fill_price, Some(dec!(34493)));
    }

    #[tokio::test]
    async fn test_fill_before_ack_implies_ack() {
        let h = harness();
        let router = router(&h, MockExchangeAdapter::new());
        let order = btc_order(&h);
        h.machine.begin_submission(order.id).unwrap();

        let order = router
            .apply_execution(ExecutionReport::Fill {
                order_id: order.id,
                exchange_order_id: Some("EX-5".to_string()),
                quantity: dec!(0.1),
                cumulative_quantity: dec!(0.1),
                price: dec!(34500),
                timestamp: chrono::Utc::now(),
            })
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.exchange_order_id.as_deref(), Some("EX-5"));
    }

    #[tokio::test]
    async fn test_fill_seen_by_status_and_report_counted_once() {
        let h = harness();
        let stalling = Arc::new(StallingAdapter::new());
        *stalling.remote.lock() = remote(RemoteStatus::PartiallyFilled, dec!(0.2), Some(dec!(34490)));
        let router = router(&h, stalling);
        let order = btc_order(&h);

        let outcome = router.submit(order.id).await.unwrap();
        assert_eq!(outcome.order().filled_quantity, dec!(0.2));

        // The venue's push channel delivers the same execution afterwards
        let order = router
            .apply_execution(ExecutionReport::Fill {
                order_id: order.id,
                exchange_order_id: Some("EX-42".to_string()),
                quantity: dec!(0.2),
                cumulative_quantity: dec!(0.2),
                price: dec!(34490),
                timestamp: chrono::Utc::now(),
            })
            .unwrap();
        assert_eq!(order.filled_quantity, dec!(0.2));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        // A later status answer with more fills adds only the difference
        let order = router
            .apply_remote(order.id, &remote(RemoteStatus::Filled, dec!(0.5), Some(dec!(34493))))
            .unwrap();
        assert_eq!(order.filled_quantity, dec!(0.5));
        assert_eq!(order.status, OrderStatus::Filled);
        // 0.2 @ 34490 known, 0.5 @ 34493 remote: the new 0.3 went at 34495
        assert_eq!(order.average_fill_price, Some(dec!(34493)));
    }

    #[tokio::test]
    async fn test_ack_after_reported_fill_keeps_exchange_id() {
        let h = harness();
        let machine = h.machine.clone();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().times(1).returning(move |order| {
            // Execution report processed before the submit reply returns
            machine
                .sync_fills(
                    order.id,
                    &FillSync {
                        exchange_order_id: None,
                        cumulative_quantity: dec!(0.2),
                        last_price: Some(dec!(34500)),
                        average_price: None,
                    },
                )
                .unwrap();
            Ok(SubmitReply::Accepted {
                exchange_order_id: "EX-1".to_string(),
            })
        });
        let router = router(&h, adapter);
        let order = btc_order(&h);

        let outcome = router.submit(order.id).await.unwrap();
        let order = outcome.order();
        assert!(matches!(outcome, SubmitOutcome::Accepted(_)));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.exchange_order_id.as_deref(), Some("EX-1"));
    }

    #[tokio::test]
    async fn test_evict_settled_spares_parked_orders() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_submit().returning(|_| {
            Ok(SubmitReply::Rejected {
                reason: "closed market".to_string(),
            })
        });
        let router = router(&h, adapter);
        let rejected = btc_order(&h);
        router.submit(rejected.id).await.unwrap();

        let parked = btc_order(&h);
        h.machine.begin_submission(parked.id).unwrap();
        router.escalate(parked.id).unwrap();
        assert_eq!(router.parked_count(), 1);

        assert_eq!(router.evict_settled(), 1);
        assert!(h.machine.get(rejected.id).is_none());
        assert!(h.machine.get(parked.id).is_some());
    }

    #[tokio::test]
    async fn test_startup_reconciles_pending_orders() {
        let h = harness();
        let mut adapter = MockExchangeAdapter::new();
        adapter
            .expect_order_status()
            .times(1)
            .returning(|_| Ok(RemoteOrderState::not_found()));
        let router = router(&h, adapter);
        let order = btc_order(&h);
        h.machine.begin_submission(order.id).unwrap();

        assert_eq!(router.reconcile_pending().await, 1);
        assert_eq!(h.machine.get(order.id).unwrap().status, OrderStatus::Failed);
    }
}
