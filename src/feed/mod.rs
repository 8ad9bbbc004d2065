//! Market tick feed ingestion

mod client;
mod manager;

pub use client::{FeedFrame, WebSocketClient};
pub use manager::{backoff_delay, FeedManager};
