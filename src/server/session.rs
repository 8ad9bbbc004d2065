//! One websocket connection attached to the event bus

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{Connection, ConnectionId};
use crate::envelope::{ControlMessage, Envelope, Feed, NotificationLevel};
use crate::error::{CoreError, Result};
use crate::AppState;

/// Stream the connection's delivery queue out and apply incoming control
/// messages until either side goes away
pub(super) async fn run(socket: WebSocket, state: Arc<AppState>) {
    let Connection { id, queue } = state.bus.connect();
    let (mut sink, mut stream) = socket.split();

    greet(&state, id);

    let mut writer = tokio::spawn(async move {
        while let Some(envelope) = queue.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection = %id, error = %e, "Failed to serialize envelope");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_state = state.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    if let Err(e) = handle_control(&reader_state, id, &text) {
                        debug!(connection = %id, error = %e, "Control message refused");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {}
    }

    // Closes the queue, which lets the writer flush what is left and exit
    state.bus.disconnect(id);
    info!(connection = %id, "Session ended");
}

/// Tell a fresh connection its id. Returns whether the greeting was queued.
fn greet(state: &AppState, id: ConnectionId) -> bool {
    let greeting = Envelope::notification(NotificationLevel::Info, format!("connected as {}", id));
    match state.bus.send_to(id, greeting) {
        Ok(_) => true,
        Err(e) => {
            warn!(connection = %id, error = %e, "Failed to queue greeting");
            false
        }
    }
}

/// Apply one control message from `connection`. Refusals are also reported to
/// the connection as an `Error` envelope.
pub fn handle_control(state: &AppState, connection: ConnectionId, text: &str) -> Result<()> {
    let result = apply_control(state, connection, text);
    if let Err(err) = &result {
        state
            .bus
            .send_to(connection, Envelope::error(err.code(), err.to_string()))?;
    }
    result
}

fn apply_control(state: &AppState, connection: ConnectionId, text: &str) -> Result<()> {
    let message: ControlMessage = serde_json::from_str(text).map_err(CoreError::from)?;

    match message {
        ControlMessage::Subscribe { feed, symbols } => {
            let added = state.bus.subscribe(connection, feed, symbols.as_deref())?;
            debug!(connection = %connection, feed = %feed, added, "Subscribed");

            // Registry first, snapshot second: a tick stored in between is
            // either published to us or part of the snapshot
            if feed == Feed::MarketData {
                for tick in state.market.snapshot_for(symbols.as_deref()) {
                    state.bus.send_to(connection, Envelope::MarketData(tick))?;
                }
            }
        }
        ControlMessage::Unsubscribe { feed, symbols } => {
            let removed = state.bus.unsubscribe(connection, feed, symbols.as_deref());
            debug!(connection = %connection, feed = %feed, removed, "Unsubscribed");
        }
        ControlMessage::Heartbeat => {
            state
                .bus
                .send_to(connection, Envelope::notification(NotificationLevel::Info, "heartbeat"))?;
        }
    }
    Ok(())
}
