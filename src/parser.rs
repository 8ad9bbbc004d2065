//! Parser for tick feed messages
//!
//! Handles deserialization of ticks and heartbeats, either bare or wrapped in
//! a `{"stream": ..., "data": ...}` envelope.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::market::MarketTick;

/// Tick message from the feed
#[derive(Debug, Clone, Deserialize)]
pub struct TickMessage {
    pub symbol: String,

    #[serde(deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    /// Best bid; falls back to `price`
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub bid: Option<Decimal>,

    /// Best ask; falls back to `price`
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub ask: Option<Decimal>,

    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub volume: Option<Decimal>,

    #[serde(default)]
    pub exchange: Option<String>,

    /// Event time (milliseconds)
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl TickMessage {
    /// Convert into a cache tick; `default_exchange` fills a missing venue and
    /// the receive time a missing timestamp
    pub fn into_tick(self, default_exchange: &str) -> MarketTick {
        let timestamp = self
            .timestamp
            .and_then(millis_to_datetime)
            .unwrap_or_else(Utc::now);
        MarketTick {
            bid: self.bid.unwrap_or(self.price),
            ask: self.ask.unwrap_or(self.price),
            volume: self.volume.unwrap_or(Decimal::ZERO),
            exchange: self.exchange.unwrap_or_else(|| default_exchange.to_string()),
            symbol: self.symbol,
            price: self.price,
            timestamp,
        }
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TypedMessage {
    Tick(TickMessage),
    Heartbeat,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
struct StreamMessage {
    #[allow(dead_code)]
    stream: String,
    data: serde_json::Value,
}

/// Parsed feed message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Tick(TickMessage),
    Heartbeat,
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw feed message. Malformed ticks are errors; messages of an
    /// unrecognised type are `Unknown`.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        if let Ok(wrapper) = serde_json::from_value::<StreamMessage>(value.clone()) {
            return Self::from_value(wrapper.data);
        }
        Self::from_value(value)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        match value.get("type").and_then(|t| t.as_str()) {
            Some("tick") | Some("heartbeat") => match serde_json::from_value(value)? {
                TypedMessage::Tick(tick) => Ok(ParsedMessage::Tick(tick)),
                TypedMessage::Heartbeat => Ok(ParsedMessage::Heartbeat),
            },
            _ => Ok(ParsedMessage::Unknown(value.to_string())),
        }
    }
}

/// Decimal given either as a JSON string or a JSON number
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDecimal {
    Text(String),
    Number(serde_json::Number),
}

impl RawDecimal {
    fn parse<E: serde::de::Error>(self) -> Result<Decimal, E> {
        let text = match self {
            RawDecimal::Text(text) => text,
            RawDecimal::Number(number) => number.to_string(),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(serde::de::Error::custom)
    }
}

fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    RawDecimal::deserialize(deserializer)?.parse()
}

fn deserialize_optional_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDecimal>::deserialize(deserializer)? {
        Some(raw) => raw.parse().map(Some),
        None => Ok(None),
    }
}
