// =============================================================================
// Upstream WS Multiplexer — one combined-stream connection for all symbols
// =============================================================================
//
// Generalizes the donor's per-stream `run_depth_stream` reconnect loop
// (`market_data/orderbook.rs`, `sleep(5s)` between attempts) into a single
// connection carrying every subscribed symbol's depth+trade streams at
// once. Demultiplexes incoming frames by `s` and forwards them with a
// non-blocking `try_send` into the owning `SymbolActor`'s channel; on a
// full channel the oldest buffered diff is dropped and a desync counted
// rather than blocking the read loop.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use super::actor::{SymbolEvent, SymbolHandle};
use super::types::{parse_depth_update, parse_trade};

/// Fixed reconnect delay, matching the donor's `loop { ...; sleep(5s) }`
/// idiom used for every WS stream it maintains.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Stagger between successive symbols' initial snapshot kicks, so a
/// multi-symbol cold start does not burst every REST call at once.
pub const SNAPSHOT_STAGGER: Duration = Duration::from_millis(150);

/// Binance only serves partial-depth streams at these fixed level counts;
/// pick the smallest one that covers the requested `depth_levels`.
const PARTIAL_DEPTH_LEVELS: [u32; 3] = [5, 10, 20];

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct StreamSpeed(pub &'static str);

impl StreamSpeed {
    pub const MS_100: StreamSpeed = StreamSpeed("100ms");
    pub const MS_250: StreamSpeed = StreamSpeed("250ms");

    /// Parse `RuntimeConfig::ws_update_speed` ("100ms"/"250ms"), falling
    /// back to 100ms on anything else rather than failing startup.
    pub fn parse(raw: &str) -> StreamSpeed {
        match raw {
            "250ms" => Self::MS_250,
            _ => Self::MS_100,
        }
    }
}

/// How the depth side of the combined stream is framed, mirroring
/// `RuntimeConfig::depth_stream_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthStreamMode {
    /// `<symbol>@depth@<speed>` — unbounded diff stream, applied against a
    /// REST snapshot (spec §4.1's default path).
    Diff,
    /// `<symbol>@depth<N>@<speed>` — venue-limited top-N levels, no REST
    /// snapshot reconciliation needed.
    Partial(u32),
}

impl DepthStreamMode {
    pub fn from_config(mode: &str, depth_levels: u32) -> Self {
        if mode.eq_ignore_ascii_case("partial") {
            let levels = PARTIAL_DEPTH_LEVELS
                .into_iter()
                .find(|&l| l >= depth_levels)
                .unwrap_or(*PARTIAL_DEPTH_LEVELS.last().unwrap());
            Self::Partial(levels)
        } else {
            Self::Diff
        }
    }

    fn stream_suffix(&self) -> String {
        match self {
            Self::Diff => "depth".to_string(),
            Self::Partial(levels) => format!("depth{levels}"),
        }
    }
}

/// Owns the single upstream connection and the table of handles it fans
/// depth/trade frames into. Held by `main` as a single `Arc<Multiplexer>`.
pub struct Multiplexer {
    base_ws_url: String,
    speed: &'static str,
    mode: DepthStreamMode,
    handles: RwLock<HashMap<String, SymbolHandle>>,
    /// Signalled by `register_symbol`/`deregister_symbol` so `run()` tears
    /// down and reopens the combined connection on a subscription change
    /// rather than waiting for the next natural reconnect cycle.
    resubscribe: Notify,
    /// Epoch-millis of the last successfully parsed upstream frame (depth or
    /// trade), read by `/health/liveness`. `0` means none received yet.
    last_message_ms: AtomicI64,
}

impl Multiplexer {
    pub fn new(base_ws_url: impl Into<String>, speed: StreamSpeed, mode: DepthStreamMode) -> Self {
        Self {
            base_ws_url: base_ws_url.into(),
            speed: speed.0,
            mode,
            handles: RwLock::new(HashMap::new()),
            resubscribe: Notify::new(),
            last_message_ms: AtomicI64::new(0),
        }
    }

    /// Epoch-millis of the last upstream frame successfully parsed, or
    /// `None` if the combined stream hasn't delivered anything yet.
    pub fn last_message_ms(&self) -> Option<i64> {
        match self.last_message_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn register_symbol(&self, handle: SymbolHandle) {
        self.handles.write().insert(handle.symbol.clone(), handle);
        self.resubscribe.notify_waiters();
    }

    pub fn deregister_symbol(&self, symbol: &str) {
        self.handles.write().remove(symbol);
        self.resubscribe.notify_waiters();
    }

    fn subscribed_symbols(&self) -> Vec<String> {
        self.handles.read().keys().cloned().collect()
    }

    fn build_stream_url(&self, symbols: &[String]) -> String {
        let depth_suffix = self.mode.stream_suffix();
        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                vec![format!("{lower}@{depth_suffix}@{}", self.speed), format!("{lower}@trade")]
            })
            .collect();
        format!("{}/stream?streams={}", self.base_ws_url, streams.join("/"))
    }

    /// Runs forever: connect, read until error/close/resubscribe signal,
    /// sleep, reconnect. Rebuilds the stream URL from the current
    /// subscription set on every (re)connect so a symbol added mid-run is
    /// picked up immediately rather than on the next natural cycle.
    pub async fn run(self: Arc<Self>) {
        loop {
            let symbols = self.subscribed_symbols();
            if symbols.is_empty() {
                self.resubscribe.notified().await;
                continue;
            }

            let url = self.build_stream_url(&symbols);
            info!(symbol_count = symbols.len(), "connecting to combined stream");

            match connect_async(&url).await {
                Ok((ws, _resp)) => {
                    tokio::select! {
                        result = self.read_loop(ws) => {
                            if let Err(err) = result {
                                warn!(error = %err, "combined stream read loop ended");
                            }
                        }
                        _ = self.resubscribe.notified() => {
                            info!("subscription set changed, reopening combined stream");
                            continue;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to connect to combined stream");
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn read_loop(&self, mut ws: WsStream) -> anyhow::Result<()> {
        while let Some(msg) = ws.next().await {
            let msg = msg?;
            match msg {
                Message::Text(text) => self.dispatch_frame(&text).await,
                Message::Ping(payload) => {
                    ws.send(Message::Pong(payload)).await?;
                }
                Message::Close(_) => {
                    warn!("combined stream closed by venue");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn dispatch_frame(&self, text: &str) {
        let envelope: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to parse combined-stream envelope");
                return;
            }
        };

        let data = &envelope["data"];
        let event_type = data["e"].as_str().unwrap_or_default();

        match event_type {
            "depthUpdate" => match parse_depth_update(data) {
                Ok((symbol, diff)) => {
                    self.mark_data_received();
                    self.forward(&symbol, SymbolEvent::DepthDiff(diff));
                }
                Err(err) => warn!(error = %err, "failed to parse depthUpdate frame"),
            },
            "trade" => match parse_trade(data) {
                Ok((symbol, trade)) => {
                    self.mark_data_received();
                    self.forward(&symbol, SymbolEvent::Trade(trade));
                }
                Err(err) => warn!(error = %err, "failed to parse trade frame"),
            },
            other => {
                warn!(event_type = other, "unrecognized combined-stream frame type");
            }
        }
    }

    fn mark_data_received(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.last_message_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn forward(&self, symbol: &str, event: SymbolEvent) {
        let handles = self.handles.read();
        if let Some(handle) = handles.get(symbol) {
            if !handle.try_send(event) {
                warn!(symbol, "symbol actor channel full, frame dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_stream_url_contains_depth_and_trade_for_every_symbol() {
        let mux = Multiplexer::new("wss://fstream.binance.com", StreamSpeed::MS_100, DepthStreamMode::Diff);
        let url = mux.build_stream_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(url.contains("btcusdt@depth@100ms"));
        assert!(url.contains("btcusdt@trade"));
        assert!(url.contains("ethusdt@depth@100ms"));
        assert!(url.contains("ethusdt@trade"));
    }

    #[test]
    fn partial_mode_builds_depth_n_stream_name() {
        let mux = Multiplexer::new(
            "wss://fstream.binance.com",
            StreamSpeed::MS_100,
            DepthStreamMode::from_config("partial", 7),
        );
        let url = mux.build_stream_url(&["BTCUSDT".to_string()]);
        assert!(url.contains("btcusdt@depth10@100ms"));
    }

    #[test]
    fn register_and_deregister_update_subscribed_set() {
        let mux = Multiplexer::new("wss://fstream.binance.com", StreamSpeed::MS_100, DepthStreamMode::Diff);
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        mux.register_symbol(SymbolHandle::new("BTCUSDT".to_string(), tx));
        assert_eq!(mux.subscribed_symbols(), vec!["BTCUSDT".to_string()]);
        mux.deregister_symbol("BTCUSDT");
        assert!(mux.subscribed_symbols().is_empty());
    }

    #[tokio::test]
    async fn dispatching_a_valid_frame_marks_data_received() {
        let mux = Multiplexer::new("wss://fstream.binance.com", StreamSpeed::MS_100, DepthStreamMode::Diff);
        assert!(mux.last_message_ms().is_none());

        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        mux.register_symbol(SymbolHandle::new("BTCUSDT".to_string(), tx));

        let frame = serde_json::json!({
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate", "E": 123, "s": "BTCUSDT",
                "U": 1, "u": 2, "b": [], "a": [],
            }
        });
        mux.dispatch_frame(&frame.to_string()).await;
        assert!(mux.last_message_ms().is_some());
    }
}
