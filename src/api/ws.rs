// =============================================================================
// Subscriber WebSocket — push-based depth/trade metrics channel
// =============================================================================
//
// Clients connect to `/stream?symbols=A,B,C` (optionally with an opaque key
// on the `Sec-WebSocket-Protocol` header or a `key` query parameter) and
// receive a `type:"metrics"` frame per symbol every time the Dispatcher fans
// one out, throttled by `Fanout`. The server pings on
// `clientHeartbeatIntervalMs`; a connection that hasn't ponged within
// `clientStaleConnectionMs` is swept by the heartbeat loop started in `main`.
// Generalized from the donor's single-connection push loop
// (`api/ws.rs`, `tokio::select!` over a push interval and a recv loop) into
// a per-subscriber registration against the shared `Fanout` registry.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

/// Close code 1008 (policy violation), used to reject an unauthenticated or
/// malformed subscription per spec §6.
const POLICY_VIOLATION: u16 = 1008;

#[derive(Deserialize)]
pub struct StreamQuery {
    symbols: Option<String>,
    key: Option<String>,
}

fn parse_symbols(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Accepts the key either via `?key=` or the `Sec-WebSocket-Protocol` header
/// (the usual workaround for browsers that cannot set custom headers on a
/// WS upgrade request).
fn extract_key(headers: &axum::http::HeaderMap, query_key: Option<&str>) -> String {
    if let Some(k) = query_key {
        if !k.is_empty() {
            return k.to_string();
        }
    }
    headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let key = extract_key(&headers, query.key.as_deref());
    if !validate_token(&key) {
        warn!("subscriber stream rejected: invalid or missing key");
        return ws
            .on_upgrade(|socket| async move {
                reject(socket, "invalid or missing key").await;
            })
            .into_response();
    }

    let symbols = parse_symbols(&query.symbols.unwrap_or_default());
    if symbols.is_empty() {
        warn!("subscriber stream rejected: no symbols requested");
        return ws
            .on_upgrade(|socket| async move {
                reject(socket, "at least one symbol is required").await;
            })
            .into_response();
    }

    for symbol in &symbols {
        state.ensure_symbol(symbol);
    }

    ws.on_upgrade(move |socket| handle_subscriber(socket, state, symbols)).into_response()
}

async fn reject(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: POLICY_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_subscriber(socket: WebSocket, state: Arc<AppState>, symbols: HashSet<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (subscriber_id, mut frames) = state.fanout.register(symbols.clone());
    info!(subscriber_id, symbols = ?symbols, "subscriber connected");

    // Replay the last known snapshot for each requested symbol immediately,
    // so a client does not wait for the next book change to see anything.
    for symbol in &symbols {
        if let Some(snapshot) = state.dispatcher.last_snapshot(symbol) {
            if let Ok(payload) = serde_json::to_value(snapshot.as_ref()) {
                let _ = sender.send(Message::Text(payload.to_string().into())).await;
            }
        }
    }

    let heartbeat_interval_ms = state.runtime_config.read().client_heartbeat_interval_ms;
    let mut heartbeat = tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval_ms));

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            frame = frames.recv() => {
                match frame {
                    Some(payload) => {
                        if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        state.fanout.record_pong(subscriber_id);
                    }
                    Some(Ok(Message::Text(_))) => {
                        // Any client text is treated as liveness, matching
                        // the donor's heartbeat-via-text-message idiom.
                        state.fanout.record_pong(subscriber_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(subscriber_id, "subscriber sent close frame");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(subscriber_id, error = %err, "subscriber receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.fanout.deregister(subscriber_id);
    info!(subscriber_id, "subscriber disconnected");
}
