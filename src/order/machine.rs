//! Order state machine
//!
//! Exclusive owner of every order. Each order sits behind its own mutex, so all
//! transitions of one order are applied one at a time in arrival order while
//! different orders proceed in parallel. Accepted transitions are journaled,
//! then committed, then published, all under that order's lock.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{self, OrderEvent};
use super::{Order, OrderId, OrderRequest, OrderStatus, OrderType, TimeInForce};
use crate::bus::EventBus;
use crate::envelope::{Envelope, Feed};
use crate::error::{CoreError, Result};
use crate::journal::{TransitionJournal, TransitionRecord};
use crate::metrics;

/// Venue-side fill progress of one order, from an execution report or a
/// status query
#[derive(Debug, Clone, PartialEq)]
pub struct FillSync {
    pub exchange_order_id: Option<String>,
    /// Total quantity the venue has filled so far
    pub cumulative_quantity: Decimal,
    /// Price of the execution that produced this report
    pub last_price: Option<Decimal>,
    /// Venue's average over `cumulative_quantity`; preferred over `last_price`
    pub average_price: Option<Decimal>,
}

#[derive(Debug)]
struct OrderEntry {
    order: Order,
    /// Reason of the cancellation currently awaiting the adapter's reply
    pending_cancel: Option<String>,
}

pub struct OrderStateMachine {
    orders: DashMap<OrderId, Arc<Mutex<OrderEntry>>>,
    client_ids: DashMap<String, OrderId>,
    bus: Arc<EventBus>,
    journal: Arc<dyn TransitionJournal>,
    sequence: AtomicU64,
    default_exchange: String,
}

impl OrderStateMachine {
    pub fn new(bus: Arc<EventBus>, journal: Arc<dyn TransitionJournal>, default_exchange: &str) -> Self {
        Self {
            orders: DashMap::new(),
            client_ids: DashMap::new(),
            bus,
            journal,
            sequence: AtomicU64::new(0),
            default_exchange: default_exchange.to_string(),
        }
    }

    /// Rebuild in-memory state from replayed journal records; the last
    /// snapshot of each order wins
    pub fn restore(
        bus: Arc<EventBus>,
        journal: Arc<dyn TransitionJournal>,
        default_exchange: &str,
        mut records: Vec<TransitionRecord>,
    ) -> Self {
        let machine = Self::new(bus, journal, default_exchange);
        records.sort_by_key(|record| record.sequence);

        let mut last_sequence = 0;
        for record in records {
            last_sequence = last_sequence.max(record.sequence);
            let order = record.order;
            if let Some(client_order_id) = &order.client_order_id {
                machine.client_ids.insert(client_order_id.clone(), order.id);
            }
            machine.orders.insert(
                order.id,
                Arc::new(Mutex::new(OrderEntry {
                    order,
                    pending_cancel: None,
                })),
            );
        }
        machine.sequence.store(last_sequence, Ordering::SeqCst);

        info!(
            orders = machine.orders.len(),
            open = machine.open_orders().len(),
            last_sequence,
            "Order state restored from journal"
        );
        machine
    }

    /// Validate `request` and store a new order in `created`.
    ///
    /// A request carrying an already known `client_order_id` returns the
    /// existing order unchanged.
    pub fn create(&self, request: OrderRequest) -> Result<Order> {
        validate(&request)?;

        match request.client_order_id.clone() {
            Some(client_order_id) => match self.client_ids.entry(client_order_id) {
                Entry::Occupied(existing) => {
                    let id = *existing.get();
                    drop(existing);
                    info!(order_id = %id, "Duplicate client_order_id, returning existing order");
                    self.get(id).ok_or(CoreError::OrderNotFound(id))
                }
                Entry::Vacant(slot) => {
                    let order = self.insert_new(request)?;
                    slot.insert(order.id);
                    Ok(order)
                }
            },
            None => self.insert_new(request),
        }
    }

    fn insert_new(&self, request: OrderRequest) -> Result<Order> {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            client_order_id: request.client_order_id,
            symbol: request.symbol,
            direction: request.direction,
            order_type: request.order_type,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            price: request.price,
            stop_price: request.stop_price,
            time_in_force: request.time_in_force,
            status: OrderStatus::Created,
            exchange: request
                .exchange
                .unwrap_or_else(|| self.default_exchange.clone()),
            exchange_order_id: None,
            created_at: now,
            updated_at: now,
            filled_at: None,
            average_fill_price: None,
            strategy_id: request.strategy_id,
            note: request.note,
        };

        self.journal.record(&self.next_record(None, &order))?;
        self.orders.insert(
            order.id,
            Arc::new(Mutex::new(OrderEntry {
                order: order.clone(),
                pending_cancel: None,
            })),
        );

        metrics::ORDER_TRANSITIONS
            .with_label_values(&[OrderStatus::Created.as_str()])
            .inc();
        self.bus.publish(
            Feed::OrderUpdates,
            &order.symbol,
            Envelope::OrderUpdate(order.to_update()),
        );
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            direction = ?order.direction,
            order_type = ?order.order_type,
            quantity = %order.quantity,
            "Order created"
        );
        Ok(order)
    }

    /// Apply one event to an order.
    ///
    /// An illegal event leaves the order untouched, is logged as a correctness
    /// alarm and publishes an `Error` envelope.
    pub fn transition(&self, order_id: OrderId, event: OrderEvent) -> Result<Order> {
        let entry = self.entry(order_id)?;
        let mut guard = entry.lock();
        self.apply_locked(&mut guard, event)
    }

    /// Move a `created` order to `pending_submission`. Returns `None` when the
    /// order is already past `created`, so a repeated submit never reaches the
    /// exchange twice.
    pub fn begin_submission(&self, order_id: OrderId) -> Result<Option<Order>> {
        let entry = self.entry(order_id)?;
        let mut guard = entry.lock();
        if guard.order.status != OrderStatus::Created {
            debug!(order_id = %order_id, status = %guard.order.status, "Submission already started");
            return Ok(None);
        }
        self.apply_locked(&mut guard, OrderEvent::Submit).map(Some)
    }

    /// Apply a submit-ack. When a fill report already implied the ack, only
    /// a still missing venue id is recorded.
    pub fn acknowledge(&self, order_id: OrderId, exchange_order_id: Option<String>) -> Result<Order> {
        let entry = self.entry(order_id)?;
        let mut guard = entry.lock();
        self.acknowledge_locked(&mut guard, exchange_order_id)
    }

    fn acknowledge_locked(
        &self,
        guard: &mut MutexGuard<'_, OrderEntry>,
        exchange_order_id: Option<String>,
    ) -> Result<Order> {
        match (guard.order.status, exchange_order_id) {
            (OrderStatus::PendingSubmission, exchange_order_id) => {
                self.apply_locked(guard, OrderEvent::SubmitAck { exchange_order_id })
            }
            (OrderStatus::Submitted | OrderStatus::PartiallyFilled, Some(exchange_order_id))
                if guard.order.exchange_order_id.is_none() =>
            {
                self.apply_locked(guard, OrderEvent::ExchangeIdAssigned { exchange_order_id })
            }
            _ => Ok(guard.order.clone()),
        }
    }

    /// Bring an order's fills up to the venue's cumulative filled quantity.
    ///
    /// Only the part beyond the local `filled_quantity` is applied, so the
    /// same execution seen through a report and through a status query is
    /// counted once. An order still in `pending_submission` is acknowledged
    /// first.
    pub fn sync_fills(&self, order_id: OrderId, sync: &FillSync) -> Result<Order> {
        let entry = self.entry(order_id)?;
        let mut guard = entry.lock();

        let delta = sync.cumulative_quantity - guard.order.filled_quantity;
        if delta <= Decimal::ZERO {
            debug!(
                order_id = %order_id,
                local = %guard.order.filled_quantity,
                remote = %sync.cumulative_quantity,
                "Fill already applied"
            );
            if !guard.order.status.is_terminal() {
                return self.acknowledge_locked(&mut guard, sync.exchange_order_id.clone());
            }
            return Ok(guard.order.clone());
        }

        if !guard.order.status.is_terminal() {
            self.acknowledge_locked(&mut guard, sync.exchange_order_id.clone())?;
        }

        let price = match (sync.average_price, sync.last_price) {
            (Some(average), _) => {
                state::implied_fill_price(&guard.order, sync.cumulative_quantity, average, delta)
            }
            (None, Some(last)) => last,
            (None, None) => {
                warn!(order_id = %order_id, delta = %delta, "Venue fill without price, not applied");
                return Ok(guard.order.clone());
            }
        };
        self.apply_locked(&mut guard, OrderEvent::Fill { quantity: delta, price })
    }

    /// Apply a cancel-reject. An order that reached a terminal status while
    /// the cancellation was in flight only has its pending request cleared.
    pub fn reject_cancel(&self, order_id: OrderId, reason: &str) -> Result<Order> {
        let entry = self.entry(order_id)?;
        let mut guard = entry.lock();
        if guard.order.status.is_terminal() {
            guard.pending_cancel = None;
            debug!(order_id = %order_id, status = %guard.order.status, reason, "Cancel rejected after terminal status");
            return Ok(guard.order.clone());
        }
        self.apply_locked(
            &mut guard,
            OrderEvent::CancelReject {
                reason: reason.to_string(),
            },
        )
    }

    /// Register a cancellation request.
    ///
    /// Only legal in `pending_submission`, `submitted` or `partially_filled`;
    /// nothing is published on refusal. The order stays in its status until
    /// the adapter acknowledges. Returns `None` when a cancellation is already
    /// in flight.
    pub fn cancel(&self, order_id: OrderId, reason: &str) -> Result<Option<Order>> {
        let entry = self.entry(order_id)?;
        let mut guard = entry.lock();

        if !guard.order.status.is_cancellable() {
            return Err(CoreError::OrderNotCancellable {
                order_id,
                status: guard.order.status,
            });
        }
        if guard.pending_cancel.is_some() {
            debug!(order_id = %order_id, "Cancellation already in flight");
            return Ok(None);
        }

        guard.pending_cancel = Some(reason.to_string());
        info!(order_id = %order_id, reason, "Cancellation requested");
        Ok(Some(guard.order.clone()))
    }

    /// Force an order to `failed` and publish an `Error` envelope describing
    /// `cause`
    pub fn fail(&self, order_id: OrderId, cause: &CoreError, exchange_state_unknown: bool) -> Result<Order> {
        let entry = self.entry(order_id)?;
        let mut guard = entry.lock();
        let order = self.apply_locked(
            &mut guard,
            OrderEvent::AdapterFailure {
                reason: cause.to_string(),
            },
        )?;

        error!(
            order_id = %order_id,
            exchange_state_unknown,
            cause = %cause,
            "Order forced to failed"
        );
        self.bus.publish(
            Feed::OrderUpdates,
            &order.symbol,
            Envelope::order_error(order_id, cause, exchange_state_unknown),
        );
        Ok(order)
    }

    fn apply_locked(&self, guard: &mut MutexGuard<'_, OrderEntry>, event: OrderEvent) -> Result<Order> {
        let order_id = guard.order.id;

        let mut next = match state::apply(&guard.order, &event, Utc::now()) {
            Ok(next) => next,
            Err(err) => {
                error!(
                    order_id = %order_id,
                    status = %guard.order.status,
                    event = event.name(),
                    "Illegal order transition refused"
                );
                metrics::ILLEGAL_TRANSITIONS.inc();
                self.bus.publish(
                    Feed::OrderUpdates,
                    &guard.order.symbol,
                    Envelope::order_error(order_id, &err, false),
                );
                return Err(err);
            }
        };

        if matches!(event, OrderEvent::CancelAck) {
            if let Some(reason) = &guard.pending_cancel {
                next.note = Some(reason.clone());
            }
        }

        if let Err(err) = self.journal.record(&self.next_record(Some(event.clone()), &next)) {
            error!(order_id = %order_id, error = %err, "Journal write failed, transition not applied");
            self.bus.publish(
                Feed::OrderUpdates,
                &guard.order.symbol,
                Envelope::order_error(order_id, &err, false),
            );
            return Err(err);
        }

        let from = guard.order.status;
        guard.order = next;
        if matches!(event, OrderEvent::CancelAck | OrderEvent::CancelReject { .. })
            || guard.order.status.is_terminal()
        {
            guard.pending_cancel = None;
        }

        let order = guard.order.clone();
        metrics::ORDER_TRANSITIONS
            .with_label_values(&[order.status.as_str()])
            .inc();
        self.bus.publish(
            Feed::OrderUpdates,
            &order.symbol,
            Envelope::OrderUpdate(order.to_update()),
        );

        debug!(
            order_id = %order_id,
            from = %from,
            to = %order.status,
            event = event.name(),
            filled = %order.filled_quantity,
            "Order transition applied"
        );
        Ok(order)
    }

    fn next_record(&self, event: Option<OrderEvent>, order: &Order) -> TransitionRecord {
        TransitionRecord {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            recorded_at: Utc::now(),
            event,
            order: order.clone(),
        }
    }

    fn entry(&self, order_id: OrderId) -> Result<Arc<Mutex<OrderEntry>>> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or(CoreError::OrderNotFound(order_id))
    }

    /// Immutable snapshot of an order
    pub fn get(&self, order_id: OrderId) -> Option<Order> {
        let entry = self.orders.get(&order_id)?.value().clone();
        let snapshot = entry.lock().order.clone();
        Some(snapshot)
    }

    pub fn find_by_client_order_id(&self, client_order_id: &str) -> Option<Order> {
        let id = *self.client_ids.get(client_order_id)?.value();
        self.get(id)
    }

    pub fn is_cancel_pending(&self, order_id: OrderId) -> bool {
        self.entry(order_id)
            .map(|entry| entry.lock().pending_cancel.is_some())
            .unwrap_or(false)
    }

    /// Snapshots of every non-terminal order
    pub fn open_orders(&self) -> Vec<Order> {
        self.snapshots(|order| !order.status.is_terminal())
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<Order> {
        self.snapshots(|order| order.status == status)
    }

    fn snapshots(&self, keep: impl Fn(&Order) -> bool) -> Vec<Order> {
        let entries: Vec<Arc<Mutex<OrderEntry>>> =
            self.orders.iter().map(|entry| entry.value().clone()).collect();
        entries
            .into_iter()
            .map(|entry| entry.lock().order.clone())
            .filter(|order| keep(order))
            .collect()
    }

    /// Forget terminal orders last updated at or before `cutoff`, except those
    /// `retain` asks to keep. Their history stays in the journal.
    pub fn evict_terminal(&self, cutoff: DateTime<Utc>, retain: impl Fn(OrderId) -> bool) -> usize {
        let expired: Vec<(OrderId, Option<String>)> = self
            .snapshots(|order| order.status.is_terminal() && order.updated_at <= cutoff)
            .into_iter()
            .filter(|order| !retain(order.id))
            .map(|order| (order.id, order.client_order_id))
            .collect();

        for (order_id, client_order_id) in &expired {
            self.orders.remove(order_id);
            if let Some(client_order_id) = client_order_id {
                self.client_ids
                    .remove_if(client_order_id, |_, id| id == order_id);
            }
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), remaining = self.orders.len(), "Terminal orders evicted");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Reject requests that must not produce any state
fn validate(request: &OrderRequest) -> Result<()> {
    let invalid = |msg: &str| Err(CoreError::InvalidOrderRequest(msg.to_string()));

    if request.symbol.trim().is_empty() {
        return invalid("symbol cannot be empty");
    }
    if request.quantity <= Decimal::ZERO {
        return invalid("quantity must be positive");
    }
    if request.price.is_some_and(|p| p <= Decimal::ZERO) {
        return invalid("price must be positive");
    }
    if request.stop_price.is_some_and(|p| p <= Decimal::ZERO) {
        return invalid("stop price must be positive");
    }

    let needs_price = matches!(request.order_type, OrderType::Limit | OrderType::StopLimit);
    let needs_stop = matches!(
        request.order_type,
        OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop
    );
    if needs_price && request.price.is_none() {
        return invalid("limit orders must specify a price");
    }
    if needs_stop && request.stop_price.is_none() {
        return invalid("stop orders must specify a stop price");
    }
    let reference = request.price.max(request.stop_price);
    if reference.is_some_and(|p| request.quantity.checked_mul(p).is_none()) {
        return invalid("order notional out of range");
    }

    match (request.order_type, request.time_in_force) {
        (OrderType::Market, TimeInForce::GoodTillCancelled) => {
            invalid("market orders cannot rest good-till-cancelled")
        }
        (
            OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop,
            TimeInForce::ImmediateOrCancel | TimeInForce::FillOrKill,
        ) => invalid("stop orders must be good-till-cancelled or day"),
        _ => {
            if request.client_order_id.as_deref().is_some_and(|c| c.trim().is_empty()) {
                warn!("Empty client_order_id supplied");
                return invalid("client_order_id cannot be empty");
            }
            Ok(())
        }
    }
}
