//! Tick feed connection manager
//!
//! Handles reconnection logic and dispatches ticks to the market data cache.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{error, info, trace, warn};

use super::{FeedFrame, WebSocketClient};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::market::MarketDataCache;
use crate::parser::ParsedMessage;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;

/// Reconnect delay after `attempts` consecutive failures
pub fn backoff_delay(base_ms: u64, attempts: u32) -> Duration {
    let delay = base_ms.saturating_mul(2u64.pow(attempts.min(6)));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// Keeps the tick feed connected and feeds every tick into the cache
pub struct FeedManager {
    market: Arc<MarketDataCache>,
    config: Arc<Config>,
    client: WebSocketClient,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
}

impl FeedManager {
    pub fn new(market: Arc<MarketDataCache>, config: Arc<Config>, endpoint: &str) -> Self {
        let client = WebSocketClient::new(endpoint, config.symbols.clone());
        Self {
            market,
            config,
            client,
            reconnect_attempts: 0,
            last_successful_connection: None,
        }
    }

    /// Run until `max_reconnect_attempts` consecutive failures (0 retries
    /// forever)
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting tick feed manager");
        let status_task = self.spawn_status_logger();

        let result = loop {
            if let Some(last_success) = self.last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            match self.connect_and_process().await {
                Ok(()) => {
                    info!("Tick feed closed normally, reconnecting...");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    error!(error = %e, "Tick feed error");
                    self.client.close().await;
                    self.reconnect_attempts += 1;

                    let max = self.config.max_reconnect_attempts;
                    if max > 0 && self.reconnect_attempts > max {
                        break Err(CoreError::WebSocketConnection(format!(
                            "giving up after {} reconnect attempts",
                            max
                        )));
                    }

                    let delay = backoff_delay(self.config.reconnect_delay_ms, self.reconnect_attempts);
                    warn!(
                        attempt = self.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after error..."
                    );
                    sleep(delay).await;
                }
            }
        };

        status_task.abort();
        result
    }

    fn spawn_status_logger(&self) -> JoinHandle<()> {
        let market = self.market.clone();
        let every = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut status_interval = interval(every);
            loop {
                status_interval.tick().await;
                for tick in market.snapshot_for(None) {
                    info!(
                        symbol = %tick.symbol,
                        price = %tick.price,
                        spread_bps = ?tick.spread_bps(),
                        age_ms = (chrono::Utc::now() - tick.timestamp).num_milliseconds(),
                        "Market data status"
                    );
                }
            }
        })
    }

    async fn connect_and_process(&mut self) -> Result<()> {
        self.client.connect().await?;

        self.last_successful_connection = Some(Instant::now());
        self.reconnect_attempts = 0;
        info!("Tick feed connected successfully, resetting reconnect counter");

        let mut last_message = Instant::now();
        let keepalive_timeout = Duration::from_secs(30);
        let recv_timeout = Duration::from_secs(45);

        loop {
            match timeout(recv_timeout, self.client.recv()).await {
                Ok(Ok(FeedFrame::Data(text))) => {
                    last_message = Instant::now();
                    if let Err(e) = self.process_message(&text) {
                        warn!(error = %e, "Failed to process message");
                    }
                }
                Ok(Ok(FeedFrame::Control)) => {
                    if last_message.elapsed() > keepalive_timeout {
                        if let Err(e) = self.client.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = self.client.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(CoreError::ConnectionTimeout);
                    }
                }
            }
        }
    }

    /// Process a single feed message
    pub fn process_message(&self, raw: &str) -> Result<()> {
        match ParsedMessage::parse(raw)? {
            ParsedMessage::Tick(message) => {
                let tick = message.into_tick(&self.config.exchange_name);
                let symbol = tick.symbol.clone();
                if !self.market.update(tick) {
                    trace!(symbol = %symbol, "Stale tick ignored");
                }
            }
            ParsedMessage::Heartbeat => trace!("Feed heartbeat"),
            ParsedMessage::Unknown(msg) => trace!(msg = %msg, "Unknown message type"),
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}
