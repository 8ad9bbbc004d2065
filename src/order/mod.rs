//! Order lifecycle module
//!
//! Owns every order from creation to a terminal status, enforces the legal
//! status transitions and routes submission/cancellation to the exchange.

mod machine;
mod reconcile;
mod router;
mod state;

pub use machine::{FillSync, OrderStateMachine};
pub use reconcile::Reconciler;
pub use router::{CancelOutcome, OrderRouter, RouterSettings, SubmitOutcome};
pub use state::OrderEvent;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::envelope::OrderUpdate;

/// Process-unique order identifier
pub type OrderId = Uuid;

/// Side of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeInForce {
    GoodTillCancelled,
    ImmediateOrCancel,
    FillOrKill,
    Day,
}

/// Order status; the serialized names are the wire vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    PendingSubmission,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::PendingSubmission => "pending_submission",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Failed => "failed",
        }
    }

    /// No transition is permitted out of a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::PendingSubmission | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller request for a new order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Idempotency token; a repeated token returns the existing order
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl OrderRequest {
    /// Good-till-cancelled limit order
    pub fn limit(symbol: &str, direction: Direction, quantity: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: None,
            symbol: symbol.to_string(),
            direction,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            time_in_force: TimeInForce::GoodTillCancelled,
            exchange: None,
            strategy_id: None,
            note: None,
        }
    }

    /// Immediate-or-cancel market order
    pub fn market(symbol: &str, direction: Direction, quantity: Decimal) -> Self {
        Self {
            client_order_id: None,
            symbol: symbol.to_string(),
            direction,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::ImmediateOrCancel,
            exchange: None,
            strategy_id: None,
            note: None,
        }
    }

    pub fn with_client_order_id(mut self, client_order_id: &str) -> Self {
        self.client_order_id = Some(client_order_id.to_string());
        self
    }
}

/// Order snapshot; the live copy is owned by [`OrderStateMachine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub exchange: String,
    pub exchange_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub average_fill_price: Option<Decimal>,
    pub strategy_id: Option<String>,
    pub note: Option<String>,
}

impl Order {
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Payload of the `OrderUpdate` envelope for this snapshot
    pub fn to_update(&self) -> OrderUpdate {
        OrderUpdate {
            order_id: self.id,
            client_order_id: self.client_order_id.clone(),
            exchange_order_id: self.exchange_order_id.clone(),
            symbol: self.symbol.clone(),
            status: self.status,
            filled_quantity: self.filled_quantity,
            average_price: self.average_fill_price,
            timestamp: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let all = [
            (OrderStatus::Created, "created"),
            (OrderStatus::PendingSubmission, "pending_submission"),
            (OrderStatus::Submitted, "submitted"),
            (OrderStatus::PartiallyFilled, "partially_filled"),
            (OrderStatus::Filled, "filled"),
            (OrderStatus::Cancelled, "cancelled"),
            (OrderStatus::Rejected, "rejected"),
            (OrderStatus::Failed, "failed"),
        ];
        for (status, name) in all {
            assert_eq!(status.as_str(), name);
            assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{}\"", name));
        }
    }

    #[test]
    fn test_request_enums_deserialize() {
        let raw = r#"{
            "symbol": "BTC/USD",
            "direction": "sell",
            "order_type": "stop-limit",
            "quantity": "1.5",
            "price": "34000",
            "stop_price": "34100",
            "time_in_force": "good-till-cancelled"
        }"#;
        let request: OrderRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.direction, Direction::Sell);
        assert_eq!(request.order_type, OrderType::StopLimit);
        assert_eq!(request.time_in_force, TimeInForce::GoodTillCancelled);
        assert!(request.client_order_id.is_none());
    }

    #[test]
    fn test_terminal_and_cancellable_sets() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::PendingSubmission.is_cancellable());
        assert!(!OrderStatus::Created.is_cancellable());
        assert!(!OrderStatus::Filled.is_cancellable());
    }
}
