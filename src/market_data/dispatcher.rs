// =============================================================================
// Downstream Dispatcher — composes and fans out the per-update snapshot
// =============================================================================
//
// After every applied depth update the owning `SymbolActor` asks the
// Dispatcher to compose a `MetricSnapshot` and deliver it to the subscriber
// fan-out, the strategy collaborator, the paper-trading collaborator, and
// (if enabled) the archive sink. The dispatcher also keeps the last
// published snapshot per symbol so read-only HTTP handlers (`/status`) can
// answer without round-tripping through an actor's channel.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::book::BookReplica;
use super::collaborators::{ArchiveKind, ArchiveSink, PaperTradingCollaborator, StrategyCollaborator};
use super::integrity::IntegrityLevel;
use super::state_machine::SymbolState;
use super::trade_tape::TradeTape;
use super::types::Level;
use crate::fanout::Fanout;

/// How many price levels each side carries in a published snapshot.
pub const TOP_N_LEVELS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub symbol: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub top_bids: Vec<Level>,
    pub top_asks: Vec<Level>,
    /// Stable FNV-1a hash over `(best_bid, best_ask, top_n)`, used by
    /// downstream consumers to dedup identical successive snapshots.
    pub state_hash: u64,
    pub event_time_ms: i64,
}

/// FNV-1a over the canonical `"{best_bid}|{best_ask}|{bids}|{asks}"` string.
/// Deterministic across processes and platforms, unlike `HashMap`'s default
/// hasher, which is what downstream dedup requires.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn state_hash(best_bid: Option<f64>, best_ask: Option<f64>, top_bids: &[Level], top_asks: &[Level]) -> u64 {
    let mut canon = String::new();
    canon.push_str(&format!("{:?}|{:?}|", best_bid, best_ask));
    for &(p, q) in top_bids {
        canon.push_str(&format!("{p}:{q},"));
    }
    canon.push('|');
    for &(p, q) in top_asks {
        canon.push_str(&format!("{p}:{q},"));
    }
    fnv1a(canon.as_bytes())
}

/// Point-in-time operational status for one symbol, published by its
/// `SymbolActor` after every state-affecting event so `/status` and
/// `/health/readiness` can answer without touching the actor's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub state: SymbolState,
    pub integrity: IntegrityLevelWire,
    pub gap_count: u64,
    pub ewma_gap_ms: f64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub last_update_id: u64,
    pub updated_ms: i64,
    /// Mean over boolean live-readiness samples taken in the last 60s,
    /// `[0, 100]`. Feeds the Autoscaler (spec §4.10) and `/health/metrics`.
    pub live_pct_60s: f64,
}

/// `IntegrityLevel` carries no serde impl of its own (it is a plain
/// classification enum used internally); this mirrors it for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityLevelWire {
    Ok,
    Degraded,
    Critical,
}

impl From<IntegrityLevel> for IntegrityLevelWire {
    fn from(level: IntegrityLevel) -> Self {
        match level {
            IntegrityLevel::Ok => Self::Ok,
            IntegrityLevel::Degraded => Self::Degraded,
            IntegrityLevel::Critical => Self::Critical,
        }
    }
}

pub struct Dispatcher {
    fanout: Arc<Fanout>,
    strategy: Arc<dyn StrategyCollaborator>,
    paper_trading: Arc<dyn PaperTradingCollaborator>,
    archive: Arc<dyn ArchiveSink>,
    archive_enabled: bool,
    last_snapshots: RwLock<HashMap<String, Arc<MetricSnapshot>>>,
    last_statuses: RwLock<HashMap<String, Arc<SymbolStatus>>>,
}

impl Dispatcher {
    pub fn new(
        fanout: Arc<Fanout>,
        strategy: Arc<dyn StrategyCollaborator>,
        paper_trading: Arc<dyn PaperTradingCollaborator>,
        archive: Arc<dyn ArchiveSink>,
    ) -> Self {
        Self {
            fanout,
            strategy,
            paper_trading,
            archive,
            archive_enabled: false,
            last_snapshots: RwLock::new(HashMap::new()),
            last_statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_archive_enabled(mut self, enabled: bool) -> Self {
        self.archive_enabled = enabled;
        self
    }

    pub async fn notify_depth_update(&self, symbol: &str, book: &BookReplica, tape: &TradeTape, now_ms: i64) {
        let best_bid = book.best_bid().map(|(p, _)| p);
        let best_ask = book.best_ask().map(|(p, _)| p);
        let (top_bids, top_asks) = book.top_levels(TOP_N_LEVELS);
        let hash = state_hash(best_bid, best_ask, &top_bids, &top_asks);

        let snapshot = Arc::new(MetricSnapshot {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            top_bids: top_bids.clone(),
            top_asks: top_asks.clone(),
            state_hash: hash,
            event_time_ms: now_ms,
        });

        self.last_snapshots
            .write()
            .insert(symbol.to_string(), snapshot.clone());

        self.strategy.on_snapshot(&snapshot);
        self.paper_trading.on_snapshot(&snapshot);

        if self.archive_enabled {
            if let Ok(payload) = serde_json::to_value(snapshot.as_ref()) {
                self.archive.record(symbol, ArchiveKind::DepthSnapshot, &payload);
            }
        }

        let frame = self.subscriber_frame(symbol, best_bid, best_ask, &top_bids, &top_asks, hash, tape, now_ms);
        self.fanout.broadcast(symbol, frame).await;
    }

    /// Compose the full subscriber-channel frame: the top-of-book, the
    /// symbol's last published status (state/integrity, if any has been
    /// published yet), and a short trade-tape summary.
    #[allow(clippy::too_many_arguments)]
    fn subscriber_frame(
        &self,
        symbol: &str,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        top_bids: &[Level],
        top_asks: &[Level],
        state_hash: u64,
        tape: &TradeTape,
        now_ms: i64,
    ) -> serde_json::Value {
        let mid_price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        };
        let spread_pct = match (best_bid, best_ask, mid_price) {
            (Some(bid), Some(ask), Some(mid)) if mid > 0.0 => Some((ask - bid) / mid * 100.0),
            _ => None,
        };
        let status = self.last_statuses.read().get(symbol).cloned();
        let one_sec = tape.metrics(now_ms, 1_000);

        serde_json::json!({
            "type": "metrics",
            "symbol": symbol,
            "state": status.as_ref().map(|s| s.state.to_string()),
            "eventTimeMs": now_ms,
            "snapshot": {
                "stateHash": state_hash,
                "ts": now_ms,
            },
            "bids": top_bids,
            "asks": top_asks,
            "bestBid": best_bid,
            "bestAsk": best_ask,
            "midPrice": mid_price,
            "spreadPct": spread_pct,
            "lastUpdateId": status.as_ref().map(|s| s.last_update_id),
            "timeAndSales": {
                "tradeCount1s": one_sec.trade_count,
                "buyVolumeRatio1s": one_sec.buy_volume_ratio(),
                "lastPrice": tape.last_price(),
            },
            "orderbookIntegrity": status.as_ref().map(|s| serde_json::json!({
                "level": s.integrity,
                "gapCount": s.gap_count,
                "avgStalenessMs": s.ewma_gap_ms,
            })),
        })
    }

    pub fn last_snapshot(&self, symbol: &str) -> Option<Arc<MetricSnapshot>> {
        self.last_snapshots.read().get(symbol).cloned()
    }

    pub fn pinned_symbols(&self) -> Vec<String> {
        self.paper_trading.pinned_symbols()
    }

    pub fn publish_status(&self, status: SymbolStatus) {
        self.last_statuses.write().insert(status.symbol.clone(), Arc::new(status));
    }

    pub fn status(&self, symbol: &str) -> Option<Arc<SymbolStatus>> {
        self.last_statuses.read().get(symbol).cloned()
    }

    pub fn all_statuses(&self) -> Vec<Arc<SymbolStatus>> {
        self.last_statuses.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_hash_is_deterministic_and_order_sensitive() {
        let a = state_hash(Some(100.0), Some(101.0), &[(100.0, 1.0)], &[(101.0, 2.0)]);
        let b = state_hash(Some(100.0), Some(101.0), &[(100.0, 1.0)], &[(101.0, 2.0)]);
        assert_eq!(a, b);
        let c = state_hash(Some(100.0), Some(101.0), &[(100.0, 1.5)], &[(101.0, 2.0)]);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn notify_depth_update_publishes_last_snapshot() {
        use super::super::collaborators::{NullArchive, NullPaperTrading, NullStrategy};

        let dispatcher = Dispatcher::new(
            Arc::new(Fanout::new()),
            Arc::new(NullStrategy),
            Arc::new(NullPaperTrading),
            Arc::new(NullArchive),
        );
        let mut book = BookReplica::new();
        let mut buf = std::collections::VecDeque::new();
        book.apply_snapshot(
            super::super::types::Snapshot {
                last_update_id: 1,
                bids: vec![(100.0, 1.0)],
                asks: vec![(101.0, 1.0)],
            },
            &mut buf,
        );
        let tape = super::super::trade_tape::TradeTape::new();
        dispatcher.notify_depth_update("BTCUSDT", &book, &tape, 123).await;
        let snap = dispatcher.last_snapshot("BTCUSDT").unwrap();
        assert_eq!(snap.best_bid, Some(100.0));
        assert_eq!(snap.best_ask, Some(101.0));
    }
}
