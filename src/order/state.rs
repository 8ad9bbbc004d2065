//! Order status transition rules
//!
//! ```text
//! created -> pending_submission -> submitted <-> partially_filled -> filled
//! pending_submission | submitted | partially_filled -> cancelled
//! pending_submission -> rejected
//! any non-terminal -> failed
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Order, OrderStatus};
use crate::error::{CoreError, Result};

/// Input to the order state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    /// Order handed to the router for submission
    Submit,
    SubmitAck { exchange_order_id: Option<String> },
    /// Venue id that arrived after the ack was implied by a fill
    ExchangeIdAssigned { exchange_order_id: String },
    SubmitReject { reason: String },
    Fill { quantity: Decimal, price: Decimal },
    CancelAck,
    CancelReject { reason: String },
    AdapterFailure { reason: String },
}

impl OrderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrderEvent::Submit => "submit",
            OrderEvent::SubmitAck { .. } => "submit-ack",
            OrderEvent::ExchangeIdAssigned { .. } => "exchange-id",
            OrderEvent::SubmitReject { .. } => "submit-reject",
            OrderEvent::Fill { .. } => "fill",
            OrderEvent::CancelAck => "cancel-ack",
            OrderEvent::CancelReject { .. } => "cancel-reject",
            OrderEvent::AdapterFailure { .. } => "adapter-failure",
        }
    }
}

/// Compute the snapshot that results from applying `event` to `order`.
///
/// The input is never modified; an illegal event yields `IllegalTransition`,
/// and so does a fill whose quantities or notional leave the decimal range.
pub(crate) fn apply(order: &Order, event: &OrderEvent, at: DateTime<Utc>) -> Result<Order> {
    use OrderStatus::*;

    let illegal = || CoreError::IllegalTransition {
        order_id: order.id,
        from: order.status,
        event: event.name(),
    };

    if order.status.is_terminal() {
        return Err(illegal());
    }

    let mut next = order.clone();
    match (order.status, event) {
        (Created, OrderEvent::Submit) => next.status = PendingSubmission,

        (PendingSubmission, OrderEvent::SubmitAck { exchange_order_id }) => {
            next.status = Submitted;
            if exchange_order_id.is_some() {
                next.exchange_order_id = exchange_order_id.clone();
            }
        }

        (Submitted | PartiallyFilled, OrderEvent::ExchangeIdAssigned { exchange_order_id })
            if order.exchange_order_id.is_none() =>
        {
            next.exchange_order_id = Some(exchange_order_id.clone());
        }

        (PendingSubmission, OrderEvent::SubmitReject { reason }) => {
            next.status = Rejected;
            next.note = Some(reason.clone());
        }

        (Submitted | PartiallyFilled, OrderEvent::Fill { quantity, price }) => {
            if *quantity <= Decimal::ZERO || *price <= Decimal::ZERO {
                return Err(illegal());
            }
            let filled = order
                .filled_quantity
                .checked_add(*quantity)
                .ok_or_else(illegal)?;
            if filled > order.quantity {
                return Err(illegal());
            }

            let notional = order
                .average_fill_price
                .unwrap_or(Decimal::ZERO)
                .checked_mul(order.filled_quantity)
                .zip(price.checked_mul(*quantity))
                .and_then(|(before, fill)| before.checked_add(fill))
                .ok_or_else(illegal)?;
            let average = notional.checked_div(filled).ok_or_else(illegal)?;
            next.average_fill_price = Some(average.normalize());
            next.filled_quantity = filled;
            next.filled_at = Some(at);
            next.status = if filled == order.quantity {
                Filled
            } else {
                PartiallyFilled
            };
        }

        (PendingSubmission | Submitted | PartiallyFilled, OrderEvent::CancelAck) => {
            next.status = Cancelled;
        }

        (PendingSubmission | Submitted | PartiallyFilled, OrderEvent::CancelReject { reason }) => {
            next.note = Some(format!("cancel rejected: {}", reason));
        }

        (_, OrderEvent::AdapterFailure { reason }) => {
            next.status = Failed;
            next.note = Some(reason.clone());
        }

        _ => return Err(illegal()),
    }

    next.updated_at = at;
    Ok(next)
}

/// Price of the fills a venue reports beyond the local `filled_quantity`,
/// derived from its cumulative average. Falls back to that average when the
/// result is not a positive price.
pub(crate) fn implied_fill_price(
    order: &Order,
    cumulative_quantity: Decimal,
    remote_average: Decimal,
    delta: Decimal,
) -> Decimal {
    let local_notional = order
        .average_fill_price
        .unwrap_or(Decimal::ZERO)
        .checked_mul(order.filled_quantity);
    remote_average
        .checked_mul(cumulative_quantity)
        .zip(local_notional)
        .and_then(|(remote, local)| remote.checked_sub(local))
        .and_then(|rest| rest.checked_div(delta))
        .filter(|price| *price > Decimal::ZERO)
        .map(|price| price.normalize())
        .unwrap_or(remote_average)
}
