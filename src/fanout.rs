// =============================================================================
// Subscriber Fan-out — downstream WebSocket broadcast registry
// =============================================================================
//
// Owns the subscriber table exclusively. `broadcast` snapshots the matching
// recipient list under the lock, then sends after releasing it — holding a
// registry lock while writing to a socket is the one pattern this module
// refuses to do, since a slow subscriber would otherwise stall every other
// subscriber's delivery.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Minimum interval between two broadcasts for the same symbol, so a flood
/// on one symbol cannot starve delivery for others. Default 250ms / 4Hz.
const DEFAULT_THROTTLE_MS: i64 = 250;

#[derive(Clone)]
pub struct Subscriber {
    pub id: u64,
    pub symbols: HashSet<String>,
    sender: mpsc::Sender<serde_json::Value>,
}

struct SubscriberState {
    subscriber: Subscriber,
    last_pong: RwLock<Instant>,
}

pub struct Fanout {
    subscribers: RwLock<HashMap<u64, SubscriberState>>,
    next_id: AtomicU64,
    last_broadcast_ms: RwLock<HashMap<String, i64>>,
    throttle_ms: i64,
    heartbeat_sent: AtomicI64,
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

impl Fanout {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            last_broadcast_ms: RwLock::new(HashMap::new()),
            throttle_ms: DEFAULT_THROTTLE_MS,
            heartbeat_sent: AtomicI64::new(0),
        }
    }

    pub fn with_throttle_ms(mut self, throttle_ms: i64) -> Self {
        self.throttle_ms = throttle_ms;
        self
    }

    /// Register a new subscriber and return its handle plus the receiving
    /// end of its outbound channel (the WS write task consumes this).
    pub fn register(&self, symbols: HashSet<String>) -> (u64, mpsc::Receiver<serde_json::Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(256);
        let subscriber = Subscriber {
            id,
            symbols,
            sender: tx,
        };
        self.subscribers.write().insert(
            id,
            SubscriberState {
                subscriber,
                last_pong: RwLock::new(Instant::now()),
            },
        );
        info!(subscriber_id = id, "subscriber registered");
        (id, rx)
    }

    pub fn deregister(&self, id: u64) {
        if self.subscribers.write().remove(&id).is_some() {
            info!(subscriber_id = id, "subscriber deregistered");
        }
    }

    pub fn record_pong(&self, id: u64) {
        if let Some(state) = self.subscribers.read().get(&id) {
            *state.last_pong.write() = Instant::now();
        }
    }

    /// The union of symbols any open subscriber cares about — what the
    /// Multiplexer must keep a live stream for.
    pub fn required_symbols(&self) -> HashSet<String> {
        self.subscribers
            .read()
            .values()
            .flat_map(|s| s.subscriber.symbols.iter().cloned())
            .collect()
    }

    /// Broadcast `payload` to every subscriber with `symbol` in its set.
    /// Snapshots the recipient list under the lock, sends after releasing
    /// it (invariant #5: exactly `{c : symbol ∈ c.subscriptions ∧ c.open}`).
    pub async fn broadcast(&self, symbol: &str, payload: serde_json::Value) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        {
            let mut last = self.last_broadcast_ms.write();
            let entry = last.entry(symbol.to_string()).or_insert(0);
            if now_ms - *entry < self.throttle_ms {
                return;
            }
            *entry = now_ms;
        }

        let recipients: Vec<mpsc::Sender<serde_json::Value>> = {
            let subs = self.subscribers.read();
            subs.values()
                .filter(|s| s.subscriber.symbols.contains(symbol))
                .map(|s| s.subscriber.sender.clone())
                .collect()
        };

        for sender in recipients {
            // Dropped subscribers are cleaned up by the heartbeat sweep, not
            // here — a closed channel on send is a silent no-op.
            let _ = sender.try_send(payload.clone());
        }
    }

    /// Disconnect every subscriber whose last pong predates `stale_after`.
    /// Invariant #6: a client not pong-ing within `staleConnectionMs` is
    /// terminated within one heartbeat tick.
    pub fn sweep_stale(&self, stale_after: std::time::Duration) -> Vec<u64> {
        let now = Instant::now();
        let stale_ids: Vec<u64> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, s)| now.duration_since(*s.last_pong.read()) > stale_after)
            .map(|(&id, _)| id)
            .collect();

        for &id in &stale_ids {
            self.deregister(id);
        }
        self.heartbeat_sent.fetch_add(1, Ordering::Relaxed);
        debug!(count = stale_ids.len(), "heartbeat sweep removed stale subscribers");
        stale_ids
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn symbols(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn broadcast_reaches_only_matching_subscribers() {
        let fanout = Fanout::new().with_throttle_ms(0);
        let (id_a, mut rx_a) = fanout.register(symbols(&["BTCUSDT"]));
        let (_id_b, mut rx_b) = fanout.register(symbols(&["ETHUSDT"]));

        fanout.broadcast("BTCUSDT", serde_json::json!({"symbol": "BTCUSDT"})).await;

        let received_a = rx_a.try_recv();
        assert!(received_a.is_ok());
        let received_b = rx_b.try_recv();
        assert!(received_b.is_err());
        let _ = id_a;
    }

    #[tokio::test]
    async fn deregistered_subscriber_receives_nothing_further() {
        let fanout = Fanout::new().with_throttle_ms(0);
        let (id, mut rx) = fanout.register(symbols(&["BTCUSDT"]));
        fanout.deregister(id);
        fanout.broadcast("BTCUSDT", serde_json::json!({})).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sweep_stale_removes_subscribers_past_deadline() {
        let fanout = Fanout::new();
        let (id, _rx) = fanout.register(symbols(&["BTCUSDT"]));
        std::thread::sleep(Duration::from_millis(5));
        let removed = fanout.sweep_stale(Duration::from_millis(1));
        assert_eq!(removed, vec![id]);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn fresh_pong_survives_sweep() {
        let fanout = Fanout::new();
        let (id, _rx) = fanout.register(symbols(&["BTCUSDT"]));
        fanout.record_pong(id);
        let removed = fanout.sweep_stale(Duration::from_secs(60));
        assert!(removed.is_empty());
        assert_eq!(fanout.subscriber_count(), 1);
    }

    #[test]
    fn required_symbols_is_the_union_of_all_subscribers() {
        let fanout = Fanout::new();
        fanout.register(symbols(&["BTCUSDT", "ETHUSDT"]));
        fanout.register(symbols(&["ETHUSDT", "SOLUSDT"]));
        let mut union: Vec<String> = fanout.required_symbols().into_iter().collect();
        union.sort();
        assert_eq!(union, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()]);
    }
}
