// =============================================================================
// AppState — process-wide shared handles composing the core engine
// =============================================================================
//
// Generalized from the donor's `AppState` (a single struct wiring every
// subsystem behind `Arc`/`RwLock` with a `state_version: AtomicU64` callers
// poll to detect change) down to the handles the depth engine's ambient
// stack actually needs: the symbol registry, the fan-out, the multiplexer,
// the autoscaler budget, the global backoff gate, and the collaborators the
// dispatcher feeds.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::binance::client::BinanceClient;
use crate::fanout::Fanout;
use crate::market_data::actor::{ActorLimits, SymbolActor, SymbolHandle};
use crate::market_data::autoscaler::{ActiveSymbolBudget, Autoscaler};
use crate::market_data::collaborators::{
    ArchiveSink, JsonlArchive, NullArchive, NullStrategy, PaperLedger, PaperTradingCollaborator, StrategyCollaborator,
};
use crate::market_data::counters::RollingCounters;
use crate::market_data::dispatcher::Dispatcher;
use crate::market_data::multiplexer::{DepthStreamMode, Multiplexer, StreamSpeed, SNAPSHOT_STAGGER};
use crate::market_data::snapshot::{GlobalBackoff, SnapshotFetcher, SymbolBackoff};
use crate::market_data::supervisor::ResyncSupervisor;
use crate::runtime_config::RuntimeConfig;

const FSTREAM_BASE_URL: &str = "wss://fstream.binance.com";

/// Everything every request handler, actor-supervisor task, and background
/// loop needs a shared handle to. Constructed once in `main` and cloned via
/// `Arc`.
pub struct AppState {
    pub runtime_config: RwLock<RuntimeConfig>,
    pub started_at: Instant,
    state_version: AtomicU64,

    pub fanout: Arc<Fanout>,
    pub multiplexer: Arc<Multiplexer>,
    pub dispatcher: Arc<Dispatcher>,
    pub binance: Arc<BinanceClient>,
    pub snapshot_fetcher: Arc<SnapshotFetcher>,
    pub global_backoff: Arc<GlobalBackoff>,
    pub autoscaler: Arc<Autoscaler>,
    pub active_symbol_budget: Arc<ActiveSymbolBudget>,
    pub paper_ledger: Arc<PaperLedger>,

    symbol_handles: RwLock<HashMap<String, SymbolHandle>>,
    symbol_joins: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
    supervisor_joins: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
    symbol_counters: RwLock<HashMap<String, Arc<RollingCounters>>>,
    symbol_backoffs: RwLock<HashMap<String, Arc<SymbolBackoff>>>,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        let fanout = Arc::new(Fanout::new());
        let binance = Arc::new(BinanceClient::new());
        let snapshot_fetcher = Arc::new(SnapshotFetcher::new(binance.http(), binance.base_url().to_string()));

        let archive_enabled = std::env::var("ARCHIVE_ENABLED").map(|v| v == "1" || v == "true").unwrap_or(false);
        let archive: Arc<dyn ArchiveSink> = if archive_enabled {
            Arc::new(JsonlArchive::new("archive.jsonl"))
        } else {
            Arc::new(NullArchive)
        };
        let strategy: Arc<dyn StrategyCollaborator> = Arc::new(NullStrategy);
        let paper_ledger = Arc::new(PaperLedger::new());
        let paper_trading: Arc<dyn PaperTradingCollaborator> = paper_ledger.clone();
        let dispatcher = Arc::new(
            Dispatcher::new(fanout.clone(), strategy, paper_trading, archive).with_archive_enabled(archive_enabled),
        );

        let speed = StreamSpeed::parse(&config.ws_update_speed);
        let mode = DepthStreamMode::from_config(&config.depth_stream_mode, config.depth_levels);
        let multiplexer = Arc::new(Multiplexer::new(FSTREAM_BASE_URL, speed, mode));
        let active_symbol_budget = Arc::new(ActiveSymbolBudget::new(config.symbol_concurrency));
        let autoscaler = Arc::new(Autoscaler::new(active_symbol_budget.clone()));

        Self {
            runtime_config: RwLock::new(config),
            started_at: Instant::now(),
            state_version: AtomicU64::new(0),
            fanout,
            multiplexer,
            dispatcher,
            binance,
            snapshot_fetcher,
            global_backoff: Arc::new(GlobalBackoff::new()),
            autoscaler,
            active_symbol_budget,
            paper_ledger,
            symbol_handles: RwLock::new(HashMap::new()),
            symbol_joins: RwLock::new(HashMap::new()),
            supervisor_joins: RwLock::new(HashMap::new()),
            symbol_counters: RwLock::new(HashMap::new()),
            symbol_backoffs: RwLock::new(HashMap::new()),
        }
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Spawn a `SymbolActor` plus its `ResyncSupervisor` for `symbol` if one
    /// is not already running, register it with the multiplexer, and return
    /// its handle.
    pub fn ensure_symbol(&self, symbol: &str) -> SymbolHandle {
        if let Some(handle) = self.symbol_handles.read().get(symbol) {
            return handle.clone();
        }

        let counters = self
            .symbol_counters
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(RollingCounters::new()))
            .clone();
        let backoff = self
            .symbol_backoffs
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(SymbolBackoff::new()))
            .clone();

        let (depth_levels, snapshot_min_interval_ms, limits) = {
            let cfg = self.runtime_config.read();
            (
                cfg.depth_levels,
                cfg.snapshot_min_interval_ms,
                ActorLimits {
                    depth_queue_max: cfg.depth_queue_max,
                    depth_lag_max_ms: cfg.depth_lag_max_ms,
                    live_desync_rate_10s_max: cfg.live_desync_rate_10s_max,
                    live_snapshot_fresh_ms: cfg.live_snapshot_fresh_ms,
                },
            )
        };

        let (handle, join) = SymbolActor::spawn(symbol.to_string(), counters.clone(), self.dispatcher.clone(), limits);
        self.multiplexer.register_symbol(handle.clone());

        // Stagger initial snapshot fetches across the currently active set
        // so a multi-symbol cold start does not burst every REST call at
        // once (spec §4.7).
        let stagger_index = self.symbol_handles.read().len() as u32;
        let initial_delay = SNAPSHOT_STAGGER * stagger_index;

        let supervisor_join = ResyncSupervisor::spawn(
            symbol.to_string(),
            handle.clone(),
            self.dispatcher.clone(),
            self.snapshot_fetcher.clone(),
            self.global_backoff.clone(),
            backoff,
            counters,
            depth_levels,
            snapshot_min_interval_ms,
            initial_delay,
        );

        self.symbol_handles.write().insert(symbol.to_string(), handle.clone());
        self.symbol_joins.write().insert(symbol.to_string(), join);
        self.supervisor_joins.write().insert(symbol.to_string(), supervisor_join);
        self.increment_version();
        handle
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.symbol_handles.read().keys().cloned().collect()
    }

    pub fn symbol_handle(&self, symbol: &str) -> Option<SymbolHandle> {
        self.symbol_handles.read().get(symbol).cloned()
    }

    /// Nudge every active symbol's actor to re-evaluate its integrity
    /// classification and record a live-uptime sample (spec §4.4/§4.9). A
    /// full actor channel just drops the tick; the next one arrives soon.
    pub fn tick_all_symbols(&self, now_ms: i64) {
        for handle in self.symbol_handles.read().values() {
            handle.try_send(crate::market_data::actor::SymbolEvent::Tick { now_ms });
        }
    }

    /// One autoscaler evaluation: gathers `live_pct_60s` across the active
    /// set, evaluates the budget, and drops any symbols the Autoscaler
    /// selected (spec §4.10).
    pub fn tick_autoscaler(&self, now_ms: i64) {
        let uptimes: Vec<crate::market_data::autoscaler::SymbolUptime> = self
            .dispatcher
            .all_statuses()
            .into_iter()
            .map(|s| crate::market_data::autoscaler::SymbolUptime {
                symbol: s.symbol.clone(),
                live_pct_60s: s.live_pct_60s,
            })
            .collect();
        let pinned = self.dispatcher.pinned_symbols();
        let decision = self.autoscaler.evaluate(now_ms, &uptimes, &pinned);
        for symbol in &decision.dropped {
            self.drop_symbol(symbol);
        }
    }

    pub fn symbol_counters(&self, symbol: &str) -> Option<Arc<RollingCounters>> {
        self.symbol_counters.read().get(symbol).cloned()
    }

    pub fn symbol_backoff(&self, symbol: &str) -> Option<Arc<SymbolBackoff>> {
        self.symbol_backoffs.read().get(symbol).cloned()
    }

    pub fn drop_symbol(&self, symbol: &str) {
        self.multiplexer.deregister_symbol(symbol);
        self.symbol_handles.write().remove(symbol);
        self.symbol_counters.write().remove(symbol);
        self.symbol_backoffs.write().remove(symbol);
        if let Some(join) = self.symbol_joins.write().remove(symbol) {
            join.abort();
        }
        if let Some(join) = self.supervisor_joins.write().remove(symbol) {
            join.abort();
        }
        self.increment_version();
    }

    /// Epoch-millis of the last upstream frame the combined stream parsed,
    /// read by `/health/liveness` (spec §6).
    pub fn last_data_received_ms(&self) -> Option<i64> {
        self.multiplexer.last_message_ms()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_symbol_is_idempotent() {
        let state = AppState::new(RuntimeConfig::default());
        let a = state.ensure_symbol("BTCUSDT");
        let b = state.ensure_symbol("BTCUSDT");
        assert_eq!(a.symbol, b.symbol);
        assert_eq!(state.active_symbols(), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn drop_symbol_removes_it_from_the_active_set() {
        let state = AppState::new(RuntimeConfig::default());
        state.ensure_symbol("ETHUSDT");
        state.drop_symbol("ETHUSDT");
        assert!(state.active_symbols().is_empty());
    }
}
