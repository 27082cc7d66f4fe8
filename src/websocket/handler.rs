//! WebSocket Streaming
//!
//! Streams market and price events to connected clients straight off the
//! event bus. Each connection owns one bounded bus subscription; a client
//! that stops reading is dropped by the bus and receives a terminal
//! `OVERFLOW` message. Closing the socket releases the subscriber slot.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::event::{EventFilter, EventKind};
use crate::services::events::EventBus;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated symbol filter; empty means all symbols
    pub symbols: Option<String>,
}

impl StreamQuery {
    fn symbol_set(&self) -> Vec<String> {
        self.symbols
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

pub async fn market_stream(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let filter = EventFilter::for_kinds([
        EventKind::OrderPlaced,
        EventKind::OrderExecuted,
        EventKind::OrderCanceled,
    ])
    .with_symbols(query.symbol_set());
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| stream_events(socket, bus, filter))
}

pub async fn price_stream(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let filter = EventFilter::for_kinds([EventKind::PriceUpdate, EventKind::PriceAlert])
        .with_symbols(query.symbol_set());
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| stream_events(socket, bus, filter))
}

async fn stream_events(socket: WebSocket, bus: EventBus, filter: EventFilter) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = bus.subscribe(filter);
    debug!("stream subscriber connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                let terminal = event.is_overflow();
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("event serialization failed: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        // Connection reset without a closing handshake
                        warn!("stream socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    debug!("stream subscriber disconnected");
    // Dropping the subscription releases the subscriber slot.
}
