//! arb-core - Event Bus and Order Lifecycle Engine
//!
//! Starts the delivery server, the order router's background tasks and, when
//! configured, the market tick feed.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use arb_core::adapter::{execution_channel, ExchangeAdapter, HttpExchangeAdapter, PaperExchange};
use arb_core::journal::{FileJournal, NullJournal, TransitionJournal};
use arb_core::order::{OrderRouter, OrderStateMachine, Reconciler, RouterSettings};
use arb_core::{server, AppState, Config, EventBus, FeedManager, MarketDataCache, StrategyPublisher};

/// Interval at which the paper exchange re-checks resting orders
const PAPER_MATCHING_INTERVAL_MS: u64 = 250;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting arb-core");

    let config = Arc::new(Config::load()?);
    info!(
        symbols = ?config.symbols,
        listen_addr = %config.listen_addr,
        exchange = %config.exchange_name,
        "Configuration loaded"
    );

    let bus = Arc::new(EventBus::new(config.queue_capacity));
    let market = Arc::new(MarketDataCache::new(bus.clone()));

    // Restore orders from the journal before accepting new work
    let records = match &config.journal_path {
        Some(path) => FileJournal::replay(path)?,
        None => Vec::new(),
    };
    let journal: Arc<dyn TransitionJournal> = match &config.journal_path {
        Some(path) => {
            info!(path = %path.display(), records = records.len(), "Journal replayed");
            Arc::new(FileJournal::open(path)?)
        }
        None => {
            warn!("No JOURNAL_PATH set, order transitions are not persisted");
            Arc::new(NullJournal)
        }
    };
    let orders = Arc::new(OrderStateMachine::restore(
        bus.clone(),
        journal,
        &config.exchange_name,
        records,
    ));

    let (executions_tx, executions_rx) = execution_channel(config.queue_capacity);
    let adapter: Arc<dyn ExchangeAdapter> = match &config.exchange_gateway_url {
        Some(url) => Arc::new(HttpExchangeAdapter::new(
            &config.exchange_name,
            url,
            config.adapter_timeout(),
        )?),
        None => {
            let paper = Arc::new(PaperExchange::new(market.clone(), executions_tx.clone()));
            tokio::spawn(
                paper
                    .clone()
                    .run_matching(Duration::from_millis(PAPER_MATCHING_INTERVAL_MS)),
            );
            info!("Using paper exchange");
            paper
        }
    };

    let router = Arc::new(OrderRouter::new(
        orders.clone(),
        adapter,
        bus.clone(),
        RouterSettings::from_config(&config),
    ));
    tokio::spawn(router.clone().run_executions(executions_rx));
    tokio::spawn(Reconciler::new(router.clone(), config.reconcile_interval()).run());

    let state = Arc::new(AppState {
        bus: bus.clone(),
        market: market.clone(),
        orders,
        router,
        strategies: Arc::new(StrategyPublisher::new(bus)),
        config: config.clone(),
    });

    let server_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::serve(server_state).await {
            error!(error = %e, "Server error");
        }
    });

    if let Some(endpoint) = config.feed_endpoint.clone() {
        let feed_config = config.clone();
        tokio::spawn(async move {
            let mut feed = FeedManager::new(market, feed_config, &endpoint);
            if let Err(e) = feed.run().await {
                error!(error = %e, "Tick feed stopped");
            }
        });
    } else {
        info!("No FEED_ENDPOINT set, market data only arrives through the library API");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    // Held until exit so the execution channel stays open in gateway mode
    drop(executions_tx);
    Ok(())
}
