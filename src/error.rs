//! Error types for the event bus and order lifecycle engine

use thiserror::Error;
use uuid::Uuid;

use crate::bus::ConnectionId;
use crate::order::OrderStatus;

/// Errors raised by the core components
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid order request: {0}")]
    InvalidOrderRequest(String),

    #[error("Illegal transition for order {order_id}: {event} not allowed in status {from}")]
    IllegalTransition {
        order_id: Uuid,
        from: OrderStatus,
        event: &'static str,
    },

    #[error("Order {order_id} cannot be cancelled in status {status}")]
    OrderNotCancellable { order_id: Uuid, status: OrderStatus },

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Adapter timed out for order {order_id} after {attempts} attempts")]
    AdapterTimeout { order_id: Uuid, attempts: u32 },

    #[error("Exchange adapter error: {0}")]
    Adapter(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Invalid strategy update: {0}")]
    InvalidStrategyUpdate(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CoreError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CoreError::Journal(format!("encode: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for CoreError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CoreError::Journal(format!("decode: {}", err))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Adapter(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Journal(err.to_string())
    }
}

impl CoreError {
    /// Stable machine-readable code used in `Error` envelopes
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidOrderRequest(_) => "invalid_order_request",
            CoreError::IllegalTransition { .. } => "illegal_transition",
            CoreError::OrderNotCancellable { .. } => "order_not_cancellable",
            CoreError::OrderNotFound(_) => "order_not_found",
            CoreError::AdapterTimeout { .. } => "adapter_timeout",
            CoreError::Adapter(_) => "adapter_error",
            CoreError::UnknownSymbol(_) => "unknown_symbol",
            CoreError::ConnectionNotFound(_) => "connection_not_found",
            CoreError::InvalidStrategyUpdate(_) => "invalid_strategy_update",
            CoreError::Journal(_) => "journal_error",
            CoreError::Config(_) => "config_error",
            CoreError::Serialization(_) => "serialization_error",
            CoreError::WebSocketConnection(_)
            | CoreError::WebSocketMessage(_)
            | CoreError::ConnectionTimeout => "feed_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
