//! Latest-value cache of market ticks
//!
//! Last value wins; this is not a time series store.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::MarketTick;
use crate::bus::EventBus;
use crate::envelope::{Envelope, Feed};
use crate::error::{CoreError, Result};
use crate::metrics;

/// Holds the newest known tick per symbol
#[derive(Debug)]
pub struct MarketDataCache {
    ticks: DashMap<String, MarketTick>,
    bus: Arc<EventBus>,
}

impl MarketDataCache {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            ticks: DashMap::new(),
            bus,
        }
    }

    /// Store `tick` unless an older-than-cached timestamp makes it stale, then
    /// publish it on the market data feed.
    ///
    /// Returns `false` for a discarded stale tick; that is not an error. The
    /// symbol's shard stays locked until the publish is enqueued, so two
    /// updates of one symbol reach subscribers in the order they were stored.
    pub fn update(&self, tick: MarketTick) -> bool {
        match self.ticks.entry(tick.symbol.clone()) {
            Entry::Occupied(mut entry) => {
                if tick.timestamp < entry.get().timestamp {
                    debug!(
                        symbol = %tick.symbol,
                        stale = %tick.timestamp,
                        cached = %entry.get().timestamp,
                        "Discarding stale tick"
                    );
                    metrics::STALE_TICKS.inc();
                    return false;
                }
                entry.insert(tick.clone());
                self.publish(tick);
            }
            Entry::Vacant(entry) => {
                entry.insert(tick.clone());
                self.publish(tick);
            }
        }
        true
    }

    fn publish(&self, tick: MarketTick) {
        let symbol = tick.symbol.clone();
        let delivered = self.bus.publish(Feed::MarketData, &symbol, Envelope::MarketData(tick));
        trace!(symbol = %symbol, delivered, "Tick published");
    }

    /// Last known tick for `symbol`
    pub fn snapshot(&self, symbol: &str) -> Result<MarketTick> {
        self.ticks
            .get(symbol)
            .map(|tick| tick.value().clone())
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))
    }

    /// Every cached tick, used to hydrate new subscribers
    pub fn snapshot_all(&self) -> HashMap<String, MarketTick> {
        self.ticks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Cached ticks for `symbols`, or all of them for `None`; unknown symbols
    /// are skipped
    pub fn snapshot_for(&self, symbols: Option<&[String]>) -> Vec<MarketTick> {
        match symbols {
            Some(symbols) => symbols
                .iter()
                .filter_map(|symbol| self.ticks.get(symbol).map(|t| t.value().clone()))
                .collect(),
            None => self.ticks.iter().map(|entry| entry.value().clone()).collect(),
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        self.ticks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}
