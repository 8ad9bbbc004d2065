//! Simulated venue filling against cached market prices

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{
    CancelReply, ExchangeAdapter, ExecutionReport, ExecutionSender, RemoteOrderState, RemoteStatus,
    SubmitReply,
};
use crate::error::Result;
use crate::market::{MarketDataCache, MarketTick};
use crate::order::{Direction, Order, OrderId, OrderType, TimeInForce};

#[derive(Debug, Clone)]
struct PaperOrder {
    exchange_order_id: String,
    direction: Direction,
    order_type: OrderType,
    time_in_force: TimeInForce,
    symbol: String,
    quantity: Decimal,
    price: Option<Decimal>,
    stop_price: Option<Decimal>,
    /// Set once the stop price has been touched
    triggered: bool,
    status: RemoteStatus,
    fill_price: Option<Decimal>,
}

impl PaperOrder {
    fn is_open(&self) -> bool {
        matches!(self.status, RemoteStatus::Open | RemoteStatus::PartiallyFilled)
    }

    fn remote_state(&self) -> RemoteOrderState {
        RemoteOrderState {
            status: self.status,
            exchange_order_id: Some(self.exchange_order_id.clone()),
            filled_quantity: if self.status == RemoteStatus::Filled {
                self.quantity
            } else {
                Decimal::ZERO
            },
            average_price: self.fill_price,
            reason: None,
        }
    }

    /// Price this order executes at against `tick`, if it is marketable now
    fn execution_price(&mut self, tick: &MarketTick) -> Option<Decimal> {
        let touch = match self.direction {
            Direction::Buy => tick.ask,
            Direction::Sell => tick.bid,
        };
        if touch <= Decimal::ZERO {
            return None;
        }

        if let Some(stop) = self.stop_price {
            if !self.triggered {
                let hit = match self.direction {
                    Direction::Buy => touch >= stop,
                    Direction::Sell => touch <= stop,
                };
                if !hit {
                    return None;
                }
                debug!(exchange_order_id = %self.exchange_order_id, stop = %stop, "Paper stop triggered");
                self.triggered = true;
            }
        }

        match (self.order_type, self.price) {
            (OrderType::Limit | OrderType::StopLimit, Some(limit)) => {
                let crosses = match self.direction {
                    Direction::Buy => limit >= touch,
                    Direction::Sell => limit <= touch,
                };
                crosses.then_some(touch)
            }
            _ => Some(touch),
        }
    }
}

/// Paper trading venue.
///
/// Every submission is acknowledged with a `PAPER-n` id. Marketable orders are
/// filled in full at the touch of the cached tick; resting orders are checked
/// again by [`PaperExchange::run_matching`].
pub struct PaperExchange {
    market: Arc<MarketDataCache>,
    executions: ExecutionSender,
    orders: Mutex<HashMap<OrderId, PaperOrder>>,
    next_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(market: Arc<MarketDataCache>, executions: ExecutionSender) -> Self {
        Self {
            market,
            executions,
            orders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Check resting orders against the latest prices every `every`
    pub async fn run_matching(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            self.match_resting().await;
        }
    }

    /// Fill every resting order that has become marketable
    pub async fn match_resting(&self) -> usize {
        let fills: Vec<ExecutionReport> = {
            let mut orders = self.orders.lock();
            orders
                .iter_mut()
                .filter(|(_, order)| order.is_open())
                .filter_map(|(id, order)| {
                    let tick = self.market.snapshot(&order.symbol).ok()?;
                    let price = order.execution_price(&tick)?;
                    order.status = RemoteStatus::Filled;
                    order.fill_price = Some(price);
                    Some(ExecutionReport::Fill {
                        order_id: *id,
                        exchange_order_id: Some(order.exchange_order_id.clone()),
                        quantity: order.quantity,
                        cumulative_quantity: order.quantity,
                        price,
                        timestamp: Utc::now(),
                    })
                })
                .collect()
        };

        let count = fills.len();
        for report in fills {
            self.report(report).await;
        }
        count
    }

    async fn report(&self, report: ExecutionReport) {
        if self.executions.send(report).await.is_err() {
            warn!("Execution channel closed, paper report dropped");
        }
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.lock().values().filter(|o| o.is_open()).count()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn submit(&self, order: &Order) -> Result<SubmitReply> {
        let tick = self.market.snapshot(&order.symbol).ok();
        if tick.is_none() && order.order_type == OrderType::Market {
            return Ok(SubmitReply::Rejected {
                reason: format!("no market data for {}", order.symbol),
            });
        }

        let exchange_order_id = format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut paper = PaperOrder {
            exchange_order_id: exchange_order_id.clone(),
            direction: order.direction,
            order_type: order.order_type,
            time_in_force: order.time_in_force,
            symbol: order.symbol.clone(),
            quantity: order.remaining_quantity(),
            price: order.price,
            stop_price: order.stop_price,
            triggered: false,
            status: RemoteStatus::Open,
            fill_price: None,
        };

        let mut follow_up = None;
        match tick.as_ref().and_then(|t| paper.execution_price(t)) {
            Some(price) => {
                paper.status = RemoteStatus::Filled;
                paper.fill_price = Some(price);
                follow_up = Some(ExecutionReport::Fill {
                    order_id: order.id,
                    exchange_order_id: Some(exchange_order_id.clone()),
                    quantity: paper.quantity,
                    cumulative_quantity: paper.quantity,
                    price,
                    timestamp: Utc::now(),
                });
            }
            None if matches!(
                paper.time_in_force,
                TimeInForce::ImmediateOrCancel | TimeInForce::FillOrKill
            ) =>
            {
                paper.status = RemoteStatus::Cancelled;
                follow_up = Some(ExecutionReport::Cancelled {
                    order_id: order.id,
                    reason: "not marketable".to_string(),
                });
            }
            None => {}
        }

        info!(
            order_id = %order.id,
            exchange_order_id = %exchange_order_id,
            status = ?paper.status,
            "Paper order accepted"
        );
        self.orders.lock().insert(order.id, paper);

        if let Some(report) = follow_up {
            self.report(report).await;
        }
        Ok(SubmitReply::Accepted { exchange_order_id })
    }

    async fn cancel(&self, order: &Order) -> Result<CancelReply> {
        let mut orders = self.orders.lock();
        let reply = match orders.get_mut(&order.id) {
            Some(paper) if paper.is_open() => {
                paper.status = RemoteStatus::Cancelled;
                CancelReply::Accepted
            }
            Some(paper) => CancelReply::Rejected {
                reason: format!("order is {:?}", paper.status).to_lowercase(),
            },
            None => CancelReply::Rejected {
                reason: "unknown order".to_string(),
            },
        };
        debug!(order_id = %order.id, reply = ?reply, "Paper cancel handled");
        Ok(reply)
    }

    async fn order_status(&self, order: &Order) -> Result<RemoteOrderState> {
        Ok(self
            .orders
            .lock()
            .get(&order.id)
            .map(PaperOrder::remote_state)
            .unwrap_or_else(RemoteOrderState::not_found))
    }
}
