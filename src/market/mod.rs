//! Market data module
//!
//! Keeps the latest tick per symbol and publishes accepted ticks on the bus.

mod cache;

pub use cache::MarketDataCache;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest observation for one symbol; also the `MarketData` envelope payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub price: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
    pub exchange: String,
}

impl MarketTick {
    /// Tick observed now with bid and ask at `price` and no volume
    pub fn new(symbol: &str, price: Decimal, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            bid: price,
            ask: price,
            volume: Decimal::ZERO,
            timestamp: Utc::now(),
            exchange: exchange.to_string(),
        }
    }

    /// Mid price when both sides are quoted
    pub fn mid_price(&self) -> Option<Decimal> {
        if self.bid > Decimal::ZERO && self.ask > Decimal::ZERO {
            Some((self.bid + self.ask) / Decimal::from(2))
        } else {
            None
        }
    }

    /// Spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        let mid = self.mid_price()?;
        Some((self.ask - self.bid) / mid * Decimal::from(10000))
    }
}
