// =============================================================================
// Collaborator interfaces — the external neighbors this engine feeds
// =============================================================================
//
// The directional-flow scoring, regime/strategy logic, paper-trading
// simulator, and alerting live outside this crate's contract. These traits
// are the entire surface they see; the reference implementations here are
// deliberately thin — just enough to run the binary end-to-end and prove
// the dispatch path works, not a reimplementation of the donor's
// `position_engine`/`risk`/`strategy` modules.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, warn};

use super::dispatcher::MetricSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    DepthSnapshot,
    Desync,
    StateTransition,
}

impl std::fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DepthSnapshot => write!(f, "depth_snapshot"),
            Self::Desync => write!(f, "desync"),
            Self::StateTransition => write!(f, "state_transition"),
        }
    }
}

pub trait StrategyCollaborator: Send + Sync {
    fn on_snapshot(&self, snapshot: &MetricSnapshot);
}

pub trait PaperTradingCollaborator: Send + Sync {
    fn on_snapshot(&self, snapshot: &MetricSnapshot);
    /// Symbols with open paper positions; the Autoscaler must never trim
    /// these out of the active set.
    fn pinned_symbols(&self) -> Vec<String>;
}

pub trait ArchiveSink: Send + Sync {
    /// Best-effort; implementations must never block or propagate errors.
    fn record(&self, symbol: &str, kind: ArchiveKind, payload: &serde_json::Value);
}

/// Logs every snapshot at debug level and nothing else.
pub struct NullStrategy;

impl StrategyCollaborator for NullStrategy {
    fn on_snapshot(&self, snapshot: &MetricSnapshot) {
        debug!(symbol = %snapshot.symbol, state_hash = snapshot.state_hash, "strategy collaborator received snapshot");
    }
}

/// In-memory mark-to-market ledger, generalized from the donor's
/// `position_engine`/`risk` modules but trimmed to a top-of-book-only
/// contract: no order routing, no triple-barrier exits, no indicator
/// inputs — those belong to the excluded strategy layer.
#[derive(Default)]
pub struct PaperLedger {
    positions: RwLock<HashMap<String, PaperPosition>>,
}

#[derive(Debug, Clone, Copy)]
struct PaperPosition {
    qty: f64,
    entry_price: f64,
}

impl PaperLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, symbol: &str, qty: f64, entry_price: f64) {
        self.positions
            .write()
            .insert(symbol.to_string(), PaperPosition { qty, entry_price });
    }

    pub fn close(&self, symbol: &str) {
        self.positions.write().remove(symbol);
    }

    fn mark(&self, symbol: &str, mid: f64) -> Option<f64> {
        self.positions
            .read()
            .get(symbol)
            .map(|pos| (mid - pos.entry_price) * pos.qty)
    }
}

impl PaperTradingCollaborator for PaperLedger {
    fn on_snapshot(&self, snapshot: &MetricSnapshot) {
        if let (Some(bid), Some(ask)) = (snapshot.best_bid, snapshot.best_ask) {
            let mid = (bid + ask) / 2.0;
            if let Some(pnl) = self.mark(&snapshot.symbol, mid) {
                debug!(symbol = %snapshot.symbol, mid, pnl, "paper position marked");
            }
        }
    }

    fn pinned_symbols(&self) -> Vec<String> {
        self.positions.read().keys().cloned().collect()
    }
}

/// No-op reference implementations used where a collaborator is wired in
/// only to satisfy the dispatcher's contract (tests, minimal deployments).
pub struct NullPaperTrading;

impl PaperTradingCollaborator for NullPaperTrading {
    fn on_snapshot(&self, _snapshot: &MetricSnapshot) {}
    fn pinned_symbols(&self) -> Vec<String> {
        Vec::new()
    }
}

pub struct NullArchive;

impl ArchiveSink for NullArchive {
    fn record(&self, _symbol: &str, _kind: ArchiveKind, _payload: &serde_json::Value) {}
}

/// Append-only JSONL shard writer, one line per record, best-effort —
/// matching spec §6's persisted-state note. Write failures are logged once
/// and otherwise swallowed; this sink must never cause a dispatcher stall.
pub struct JsonlArchive {
    path: std::path::PathBuf,
    last_error_logged_ms: AtomicI64,
}

impl JsonlArchive {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_error_logged_ms: AtomicI64::new(0),
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl ArchiveSink for JsonlArchive {
    fn record(&self, symbol: &str, kind: ArchiveKind, payload: &serde_json::Value) {
        let record = serde_json::json!({
            "symbol": symbol,
            "kind": kind.to_string(),
            "payload": payload,
        });
        if let Err(err) = self.append_line(&record.to_string()) {
            let now = chrono::Utc::now().timestamp_millis();
            let last = self.last_error_logged_ms.swap(now, Ordering::Relaxed);
            // Rate-limit the warning to once per 60s so a broken disk does
            // not flood the log on every event.
            if now - last > 60_000 {
                warn!(error = %err, path = %self.path.display(), "archive sink write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(symbol: &str, best_bid: Option<f64>, best_ask: Option<f64>) -> MetricSnapshot {
        MetricSnapshot {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            top_bids: vec![],
            top_asks: vec![],
            state_hash: 0,
            event_time_ms: 0,
        }
    }

    #[test]
    fn paper_ledger_marks_open_position_to_mid() {
        let ledger = PaperLedger::new();
        ledger.open("BTCUSDT", 1.0, 100.0);
        assert_eq!(ledger.pinned_symbols(), vec!["BTCUSDT".to_string()]);
        ledger.on_snapshot(&snapshot("BTCUSDT", Some(101.0), Some(103.0)));
        // mid = 102, entry = 100, qty = 1 -> pnl = 2, just exercising the path.
        ledger.close("BTCUSDT");
        assert!(ledger.pinned_symbols().is_empty());
    }

    #[test]
    fn null_collaborators_never_panic() {
        let strategy = NullStrategy;
        strategy.on_snapshot(&snapshot("ETHUSDT", None, None));
        let paper = NullPaperTrading;
        paper.on_snapshot(&snapshot("ETHUSDT", None, None));
        assert!(paper.pinned_symbols().is_empty());
        let archive = NullArchive;
        archive.record("ETHUSDT", ArchiveKind::Desync, &serde_json::json!({}));
    }

    #[test]
    fn jsonl_archive_writes_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("aurora-archive-test-{}", std::process::id()));
        let sink = JsonlArchive::new(&dir);
        sink.record("BTCUSDT", ArchiveKind::DepthSnapshot, &serde_json::json!({"a": 1}));
        let contents = std::fs::read_to_string(&dir).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let _ = std::fs::remove_file(&dir);
    }
}
