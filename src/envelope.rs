//! Wire envelopes exchanged with the delivery transport
//!
//! Every message is `{"type": ..., "payload": {...}}`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;
use crate::market::MarketTick;
use crate::order::OrderStatus;

/// Logical category of real-time events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    MarketData,
    OrderUpdates,
    StrategyUpdates,
}

impl Feed {
    pub const ALL: [Feed; 3] = [Feed::MarketData, Feed::OrderUpdates, Feed::StrategyUpdates];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::MarketData => "market_data",
            Feed::OrderUpdates => "order_updates",
            Feed::StrategyUpdates => "strategy_updates",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order state change as seen by consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Scored signal pushed by a strategy evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyUpdate {
    pub strategy: String,
    /// Score in `[0, 1]`
    pub confidence: f64,
    pub expected_profit: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    /// Set when the true exchange-side state of `order_id` could not be determined
    #[serde(default)]
    pub exchange_state_unknown: bool,
    pub timestamp: DateTime<Utc>,
}

/// Event envelope delivered to connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Envelope {
    MarketData(MarketTick),
    OrderUpdate(OrderUpdate),
    StrategyUpdate(StrategyUpdate),
    Notification(Notification),
    Error(ErrorNotice),
}

impl Envelope {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Envelope::MarketData(tick) => tick.timestamp,
            Envelope::OrderUpdate(update) => update.timestamp,
            Envelope::StrategyUpdate(update) => update.timestamp,
            Envelope::Notification(notification) => notification.timestamp,
            Envelope::Error(notice) => notice.timestamp,
        }
    }

    /// Market data may be coalesced or dropped under back-pressure; everything
    /// else must reach the consumer or the consumer is disconnected.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Envelope::MarketData(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::MarketData(_) => "MarketData",
            Envelope::OrderUpdate(_) => "OrderUpdate",
            Envelope::StrategyUpdate(_) => "StrategyUpdate",
            Envelope::Notification(_) => "Notification",
            Envelope::Error(_) => "Error",
        }
    }

    pub fn notification(level: NotificationLevel, message: impl Into<String>) -> Self {
        Envelope::Notification(Notification {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Envelope::Error(ErrorNotice {
            code: code.to_string(),
            message: message.into(),
            order_id: None,
            exchange_state_unknown: false,
            timestamp: Utc::now(),
        })
    }

    /// Error envelope describing a failure tied to an order
    pub fn order_error(order_id: Uuid, err: &CoreError, exchange_state_unknown: bool) -> Self {
        Envelope::Error(ErrorNotice {
            code: err.code().to_string(),
            message: err.to_string(),
            order_id: Some(order_id),
            exchange_state_unknown,
            timestamp: Utc::now(),
        })
    }
}

/// Control messages sent by connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    Subscribe {
        feed: Feed,
        #[serde(default)]
        symbols: Option<Vec<String>>,
    },
    Unsubscribe {
        feed: Feed,
        #[serde(default)]
        symbols: Option<Vec<String>>,
    },
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_order_update_shape() {
        let update = Envelope::OrderUpdate(OrderUpdate {
            order_id: Uuid::nil(),
            client_order_id: None,
            exchange_order_id: None,
            symbol: "BTC/USD".to_string(),
            status: OrderStatus::PartiallyFilled,
            filled_quantity: dec!(0.2),
            average_price: Some(dec!(34490.0)),
            timestamp: Utc::now(),
        });

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "OrderUpdate");
        assert_eq!(value["payload"]["status"], "partially_filled");
        assert_eq!(value["payload"]["filled_quantity"], "0.2");
        assert!(value["payload"].get("client_order_id").is_none());
    }

    #[test]
    fn test_subscribe_control_message() {
        let raw = json!({
            "type": "Subscribe",
            "payload": { "feed": "market_data", "symbols": ["ETH/USD"] }
        });
        let msg: ControlMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Subscribe {
                feed: Feed::MarketData,
                symbols: Some(vec!["ETH/USD".to_string()]),
            }
        );

        let wildcard: ControlMessage = serde_json::from_str(
            r#"{"type":"Unsubscribe","payload":{"feed":"order_updates"}}"#,
        )
        .unwrap();
        assert_eq!(
            wildcard,
            ControlMessage::Unsubscribe {
                feed: Feed::OrderUpdates,
                symbols: None,
            }
        );
    }

    #[test]
    fn test_error_envelope_carries_unknown_flag() {
        let err = CoreError::AdapterTimeout {
            order_id: Uuid::nil(),
            attempts: 3,
        };
        let value = serde_json::to_value(Envelope::order_error(Uuid::nil(), &err, true)).unwrap();
        assert_eq!(value["type"], "Error");
        assert_eq!(value["payload"]["code"], "adapter_timeout");
        assert_eq!(value["payload"]["exchange_state_unknown"], true);
    }
}
