//! Exchange adapter collaborator
//!
//! The router talks to venues only through [`ExchangeAdapter`]. Replies to
//! submit and cancel come back from the call itself; fills and unsolicited
//! cancellations arrive later as [`ExecutionReport`]s on an mpsc channel.

mod http;
mod paper;

pub use http::HttpExchangeAdapter;
pub use paper::PaperExchange;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::order::{Order, OrderId};

/// Venue answer to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReply {
    Accepted { exchange_order_id: String },
    Rejected { reason: String },
}

/// Venue answer to a cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReply {
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// The venue has never seen the order
    NotFound,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl RemoteStatus {
    /// Whether the answer settles what happened to a submission
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, RemoteStatus::NotFound)
    }
}

/// Venue-side view of an order, answered by a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOrderState {
    pub status: RemoteStatus,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    #[serde(default)]
    pub filled_quantity: Decimal,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RemoteOrderState {
    pub fn not_found() -> Self {
        Self {
            status: RemoteStatus::NotFound,
            exchange_order_id: None,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            reason: None,
        }
    }
}

/// Unsolicited report pushed by a venue
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    Fill {
        order_id: OrderId,
        exchange_order_id: Option<String>,
        /// Size of this execution
        quantity: Decimal,
        /// Venue total filled for the order, this execution included
        cumulative_quantity: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        order_id: OrderId,
        reason: String,
    },
}

impl ExecutionReport {
    pub fn order_id(&self) -> OrderId {
        match self {
            ExecutionReport::Fill { order_id, .. } | ExecutionReport::Cancelled { order_id, .. } => {
                *order_id
            }
        }
    }
}

pub type ExecutionSender = mpsc::Sender<ExecutionReport>;
pub type ExecutionReceiver = mpsc::Receiver<ExecutionReport>;

/// Channel carrying execution reports from adapters to the router
pub fn execution_channel(capacity: usize) -> (ExecutionSender, ExecutionReceiver) {
    mpsc::channel(capacity)
}

/// Order entry interface of one venue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn submit(&self, order: &Order) -> Result<SubmitReply>;

    async fn cancel(&self, order: &Order) -> Result<CancelReply>;

    /// Query what the venue knows about `order`; used to resolve timeouts
    async fn order_status(&self, order: &Order) -> Result<RemoteOrderState>;
}
