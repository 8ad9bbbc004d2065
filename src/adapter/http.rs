//! JSON order-gateway client
//!
//! Orders are keyed at the gateway by our own order id, so a status query can
//! find an order even when its submission reply was lost.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{CancelReply, ExchangeAdapter, RemoteOrderState, SubmitReply};
use crate::error::{CoreError, Result};
use crate::order::{Direction, Order, OrderId, OrderType, TimeInForce};

#[derive(Debug, Serialize)]
struct NewOrderBody<'a> {
    client_order_id: OrderId,
    symbol: &'a str,
    side: Direction,
    #[serde(rename = "type")]
    order_type: OrderType,
    quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<Decimal>,
    time_in_force: TimeInForce,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum GatewayReply {
    Accepted {
        #[serde(default)]
        exchange_order_id: Option<String>,
    },
    Rejected {
        #[serde(default)]
        reason: Option<String>,
    },
}

pub struct HttpExchangeAdapter {
    name: String,
    base_url: String,
    client: Client,
}

impl HttpExchangeAdapter {
    /// `request_timeout` bounds each HTTP exchange; the router applies its own
    /// deadline on top
    pub fn new(name: &str, base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        info!(exchange = name, base_url, "HTTP exchange adapter configured");
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn order_url(&self, order_id: OrderId) -> String {
        format!("{}/orders/{}", self.base_url, order_id)
    }

    async fn read_reply(response: reqwest::Response) -> Result<GatewayReply> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Adapter(format!("gateway returned {}: {}", status, body)));
        }
        Ok(response.json::<GatewayReply>().await?)
    }
}

#[async_trait]
impl ExchangeAdapter for HttpExchangeAdapter {
    async fn submit(&self, order: &Order) -> Result<SubmitReply> {
        let body = NewOrderBody {
            client_order_id: order.id,
            symbol: &order.symbol,
            side: order.direction,
            order_type: order.order_type,
            quantity: order.remaining_quantity(),
            price: order.price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
        };

        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .json(&body)
            .send()
            .await?;

        let reply = match Self::read_reply(response).await? {
            GatewayReply::Accepted { exchange_order_id } => SubmitReply::Accepted {
                exchange_order_id: exchange_order_id.unwrap_or_else(|| order.id.to_string()),
            },
            GatewayReply::Rejected { reason } => SubmitReply::Rejected {
                reason: reason.unwrap_or_else(|| "rejected by gateway".to_string()),
            },
        };
        debug!(exchange = %self.name, order_id = %order.id, reply = ?reply, "Submit answered");
        Ok(reply)
    }

    async fn cancel(&self, order: &Order) -> Result<CancelReply> {
        let response = self.client.delete(self.order_url(order.id)).send().await?;

        let reply = match Self::read_reply(response).await? {
            GatewayReply::Accepted { .. } => CancelReply::Accepted,
            GatewayReply::Rejected { reason } => CancelReply::Rejected {
                reason: reason.unwrap_or_else(|| "rejected by gateway".to_string()),
            },
        };
        debug!(exchange = %self.name, order_id = %order.id, reply = ?reply, "Cancel answered");
        Ok(reply)
    }

    async fn order_status(&self, order: &Order) -> Result<RemoteOrderState> {
        let response = self.client.get(self.order_url(order.id)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(RemoteOrderState::not_found()),
            status if status.is_success() => Ok(response.json::<RemoteOrderState>().await?),
            status => Err(CoreError::Adapter(format!("status query returned {}", status))),
        }
    }
}
