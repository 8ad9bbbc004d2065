//! arb-core - Event Bus and Order Lifecycle Engine
//!
//! Real-time core of a multi-venue arbitrage platform: fans market data, order
//! updates and strategy signals out to subscribed connections, and drives every
//! order through a validated lifecycle against an exchange adapter.

use std::sync::Arc;

pub mod adapter;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod feed;
pub mod journal;
pub mod market;
pub mod metrics;
pub mod order;
pub mod parser;
pub mod server;
pub mod strategy;

pub use adapter::{ExchangeAdapter, HttpExchangeAdapter, PaperExchange};
pub use bus::{Connection, ConnectionId, DeliveryQueue, EventBus, SubscriptionRegistry};
pub use config::Config;
pub use envelope::{ControlMessage, Envelope, Feed};
pub use error::{CoreError, Result};
pub use feed::FeedManager;
pub use journal::{FileJournal, NullJournal, TransitionJournal};
pub use market::{MarketDataCache, MarketTick};
pub use order::{
    Order, OrderEvent, OrderRequest, OrderRouter, OrderStateMachine, OrderStatus, Reconciler,
};
pub use strategy::StrategyPublisher;

/// Application state shared across components
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub market: Arc<MarketDataCache>,
    pub orders: Arc<OrderStateMachine>,
    pub router: Arc<OrderRouter>,
    pub strategies: Arc<StrategyPublisher>,
    pub config: Arc<Config>,
}
