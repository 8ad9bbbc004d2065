//! Subscription registry
//!
//! Pure mapping from `(feed, symbol)` to interested connections. Lookups are
//! hash based, so resolving subscribers costs O(matching subscribers) rather
//! than O(all connections).

use std::collections::{HashMap, HashSet};

use super::ConnectionId;
use crate::envelope::Feed;

/// Subscribers of one feed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct FeedIndex {
    /// Connections subscribed to every key on the feed
    wildcard: HashSet<ConnectionId>,
    /// Connections subscribed to individual keys
    keyed: HashMap<String, HashSet<ConnectionId>>,
}

impl FeedIndex {
    fn is_empty(&self) -> bool {
        self.wildcard.is_empty() && self.keyed.is_empty()
    }
}

/// What a single connection is subscribed to
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionSubscriptions {
    pub wildcard: HashSet<Feed>,
    pub keyed: HashSet<(Feed, String)>,
}

impl ConnectionSubscriptions {
    fn is_empty(&self) -> bool {
        self.wildcard.is_empty() && self.keyed.is_empty()
    }
}

/// Many-to-many mapping between connections and `(feed, symbol)` pairs.
///
/// Both directions are indexed: by topic for fanout, by connection for
/// unsubscribe and disconnect. Empty entries are always pruned, so a
/// subscribe followed by the matching unsubscribe leaves the registry equal to
/// one that never saw either.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    feeds: HashMap<Feed, FeedIndex>,
    connections: HashMap<ConnectionId, ConnectionSubscriptions>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `connection` to `symbols` on `feed`, or to every symbol when
    /// `symbols` is `None`. Returns how many pairs were newly added.
    pub fn add(&mut self, connection: ConnectionId, feed: Feed, symbols: Option<&[String]>) -> usize {
        let index = self.feeds.entry(feed).or_default();
        let subs = self.connections.entry(connection).or_default();

        match symbols {
            None => {
                let added = index.wildcard.insert(connection);
                subs.wildcard.insert(feed);
                usize::from(added)
            }
            Some(symbols) => {
                let mut added = 0;
                for symbol in symbols {
                    if index
                        .keyed
                        .entry(symbol.clone())
                        .or_default()
                        .insert(connection)
                    {
                        added += 1;
                    }
                    subs.keyed.insert((feed, symbol.clone()));
                }
                self.prune(connection, feed);
                added
            }
        }
    }

    /// Remove `symbols` from the connection's subscription on `feed`. `None`
    /// removes the whole feed (wildcard and every keyed symbol). Absent pairs
    /// are ignored. Returns how many pairs were removed.
    pub fn remove(&mut self, connection: ConnectionId, feed: Feed, symbols: Option<&[String]>) -> usize {
        let Some(subs) = self.connections.get_mut(&connection) else {
            return 0;
        };

        let targets: Vec<String> = match symbols {
            Some(symbols) => symbols.to_vec(),
            None => subs
                .keyed
                .iter()
                .filter(|(f, _)| *f == feed)
                .map(|(_, s)| s.clone())
                .collect(),
        };

        let mut removed = 0;
        if symbols.is_none() && subs.wildcard.remove(&feed) {
            if let Some(index) = self.feeds.get_mut(&feed) {
                index.wildcard.remove(&connection);
            }
            removed += 1;
        }

        for symbol in targets {
            if !subs.keyed.remove(&(feed, symbol.clone())) {
                continue;
            }
            removed += 1;
            if let Some(index) = self.feeds.get_mut(&feed) {
                if let Some(set) = index.keyed.get_mut(&symbol) {
                    set.remove(&connection);
                    if set.is_empty() {
                        index.keyed.remove(&symbol);
                    }
                }
            }
        }

        self.prune(connection, feed);
        removed
    }

    /// Drop every subscription held by `connection`
    pub fn remove_connection(&mut self, connection: ConnectionId) -> bool {
        let Some(subs) = self.connections.remove(&connection) else {
            return false;
        };

        for feed in subs.wildcard {
            if let Some(index) = self.feeds.get_mut(&feed) {
                index.wildcard.remove(&connection);
            }
        }
        for (feed, symbol) in subs.keyed {
            if let Some(index) = self.feeds.get_mut(&feed) {
                if let Some(set) = index.keyed.get_mut(&symbol) {
                    set.remove(&connection);
                    if set.is_empty() {
                        index.keyed.remove(&symbol);
                    }
                }
            }
        }
        self.feeds.retain(|_, index| !index.is_empty());
        true
    }

    /// Connections interested in `(feed, key)`, wildcard subscribers included,
    /// each listed once
    pub fn subscribers(&self, feed: Feed, key: &str) -> Vec<ConnectionId> {
        let Some(index) = self.feeds.get(&feed) else {
            return Vec::new();
        };

        let mut result: Vec<ConnectionId> = index.wildcard.iter().copied().collect();
        if let Some(keyed) = index.keyed.get(key) {
            result.extend(keyed.iter().filter(|c| !index.wildcard.contains(c)).copied());
        }
        result
    }

    pub fn is_subscribed(&self, connection: ConnectionId, feed: Feed, key: &str) -> bool {
        self.connections
            .get(&connection)
            .map(|subs| subs.wildcard.contains(&feed) || subs.keyed.contains(&(feed, key.to_string())))
            .unwrap_or(false)
    }

    pub fn subscriptions(&self, connection: ConnectionId) -> Option<&ConnectionSubscriptions> {
        self.connections.get(&connection)
    }

    /// Number of connections holding at least one subscription
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn prune(&mut self, connection: ConnectionId, feed: Feed) {
        if self
            .connections
            .get(&connection)
            .map(ConnectionSubscriptions::is_empty)
            .unwrap_or(false)
        {
            self.connections.remove(&connection);
        }
        if self.feeds.get(&feed).map(FeedIndex::is_empty).unwrap_or(false) {
            self.feeds.remove(&feed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_keyed_and_wildcard_lookup() {
        let mut registry = SubscriptionRegistry::new();
        let a = ConnectionId(1);
        let b = ConnectionId(2);

        registry.add(a, Feed::MarketData, Some(&symbols(&["ETH/USD"])));
        registry.add(b, Feed::MarketData, None);

        let mut eth = registry.subscribers(Feed::MarketData, "ETH/USD");
        eth.sort();
        assert_eq!(eth, vec![a, b]);
        assert_eq!(registry.subscribers(Feed::MarketData, "BTC/USD"), vec![b]);
        assert!(registry.subscribers(Feed::OrderUpdates, "ETH/USD").is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        let a = ConnectionId(1);

        assert_eq!(registry.add(a, Feed::MarketData, Some(&symbols(&["BTC/USD"]))), 1);
        let before = registry.clone();
        assert_eq!(registry.add(a, Feed::MarketData, Some(&symbols(&["BTC/USD"]))), 0);
        assert_eq!(registry, before);
    }

    #[test]
    fn test_wildcard_and_keyed_listed_once() {
        let mut registry = SubscriptionRegistry::new();
        let a = ConnectionId(1);
        registry.add(a, Feed::MarketData, None);
        registry.add(a, Feed::MarketData, Some(&symbols(&["BTC/USD"])));

        assert_eq!(registry.subscribers(Feed::MarketData, "BTC/USD"), vec![a]);
    }

    #[test]
    fn test_remove_single_symbol_keeps_others() {
        let mut registry = SubscriptionRegistry::new();
        let a = ConnectionId(7);
        registry.add(a, Feed::MarketData, Some(&symbols(&["BTC/USD", "ETH/USD"])));

        assert_eq!(registry.remove(a, Feed::MarketData, Some(&symbols(&["BTC/USD"]))), 1);
        assert!(!registry.is_subscribed(a, Feed::MarketData, "BTC/USD"));
        assert!(registry.is_subscribed(a, Feed::MarketData, "ETH/USD"));
    }

    #[test]
    fn test_remove_missing_pair_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.remove(ConnectionId(1), Feed::OrderUpdates, None), 0);
        assert_eq!(registry, SubscriptionRegistry::default());
    }

    #[test]
    fn test_remove_feed_without_symbols_clears_feed() {
        let mut registry = SubscriptionRegistry::new();
        let a = ConnectionId(3);
        registry.add(a, Feed::MarketData, None);
        registry.add(a, Feed::MarketData, Some(&symbols(&["BTC/USD"])));
        registry.add(a, Feed::OrderUpdates, None);

        assert_eq!(registry.remove(a, Feed::MarketData, None), 2);
        assert!(registry.subscribers(Feed::MarketData, "BTC/USD").is_empty());
        assert_eq!(registry.subscribers(Feed::OrderUpdates, "BTC/USD"), vec![a]);
    }

    #[test]
    fn test_remove_connection_clears_everything() {
        let mut registry = SubscriptionRegistry::new();
        let a = ConnectionId(1);
        let b = ConnectionId(2);
        registry.add(a, Feed::MarketData, Some(&symbols(&["BTC/USD"])));
        registry.add(a, Feed::StrategyUpdates, None);
        registry.add(b, Feed::MarketData, Some(&symbols(&["BTC/USD"])));

        assert!(registry.remove_connection(a));
        assert!(!registry.remove_connection(a));
        assert_eq!(registry.subscribers(Feed::MarketData, "BTC/USD"), vec![b]);
        assert_eq!(registry.connection_count(), 1);
    }

    fn feed_strategy() -> impl Strategy<Value = Feed> {
        prop_oneof![
            Just(Feed::MarketData),
            Just(Feed::OrderUpdates),
            Just(Feed::StrategyUpdates),
        ]
    }

    proptest! {
        #[test]
        fn prop_subscribe_unsubscribe_round_trip(
            existing in proptest::collection::vec((0u64..4, feed_strategy(), "[A-C]{3}"), 0..12),
            feed in feed_strategy(),
            picked in proptest::collection::hash_set("[D-F]{3}", 1..5),
            wildcard in any::<bool>(),
        ) {
            let mut registry = SubscriptionRegistry::new();
            for (conn, f, symbol) in &existing {
                registry.add(ConnectionId(*conn), *f, Some(&[symbol.clone()]));
            }
            let before = registry.clone();

            // Fresh connection id so the pair cannot overlap existing state
            let connection = ConnectionId(99);
            let picked: Vec<String> = picked.into_iter().collect();
            let symbols = if wildcard { None } else { Some(picked.as_slice()) };

            registry.add(connection, feed, symbols);
            registry.remove(connection, feed, symbols);

            prop_assert_eq!(registry, before);
        }
    }
}
