// =============================================================================
// Resync Supervisor — drives the snapshot-fetch side of the state machine
// =============================================================================
//
// The `SymbolActor` only ever reacts to events pushed onto its channel; it
// never reaches out to the network itself (spec §4.1/§4.3's separation of
// "apply" from "fetch"). This module is the other half: one supervisor task
// per symbol that watches the actor's published `SymbolStatus`, and when it
// sees `SNAPSHOT_PENDING`, `RESYNCING`, or `HALTED`, drives `SnapshotFetcher`
// against the per-symbol and global backoff gates and feeds the outcome back
// in as a `SymbolEvent`. Mirrors the donor's `loop { ...; sleep(5s) }`
// reconnect idiom, just polling state instead of a raw socket.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::actor::{SymbolEvent, SymbolHandle};
use super::counters::RollingCounters;
use super::dispatcher::Dispatcher;
use super::snapshot::{FetchOutcome, GlobalBackoff, SnapshotFetcher, SymbolBackoff};
use super::state_machine::SymbolState;

/// How often the supervisor polls the published status between attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long `RESYNCING` waits before the actor is nudged back to
/// `SNAPSHOT_PENDING` for another attempt.
const RESYNC_THROTTLE: Duration = Duration::from_millis(500);

pub struct ResyncSupervisor {
    symbol: String,
    handle: SymbolHandle,
    dispatcher: Arc<Dispatcher>,
    fetcher: Arc<SnapshotFetcher>,
    global_backoff: Arc<GlobalBackoff>,
    symbol_backoff: Arc<SymbolBackoff>,
    counters: Arc<RollingCounters>,
    depth_levels: u32,
    snapshot_min_interval_ms: u64,
    initial_delay: Duration,
}

impl ResyncSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        symbol: String,
        handle: SymbolHandle,
        dispatcher: Arc<Dispatcher>,
        fetcher: Arc<SnapshotFetcher>,
        global_backoff: Arc<GlobalBackoff>,
        symbol_backoff: Arc<SymbolBackoff>,
        counters: Arc<RollingCounters>,
        depth_levels: u32,
        snapshot_min_interval_ms: u64,
        initial_delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Self {
            symbol,
            handle,
            dispatcher,
            fetcher,
            global_backoff,
            symbol_backoff,
            counters,
            depth_levels,
            snapshot_min_interval_ms,
            initial_delay,
        };
        tokio::spawn(supervisor.run())
    }

    async fn run(self) {
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }
        self.handle.send(SymbolEvent::FirstSubscription).await;
        loop {
            let now_ms = chrono::Utc::now().timestamp_millis();
            match self.current_state() {
                Some(SymbolState::SnapshotPending) => self.try_fetch(now_ms).await,
                Some(SymbolState::Resyncing) => {
                    tokio::time::sleep(RESYNC_THROTTLE).await;
                    self.handle.send(SymbolEvent::ResyncThrottleElapsed).await;
                }
                Some(SymbolState::Halted { .. }) => {
                    if !self.global_backoff.is_armed(now_ms) {
                        self.handle.send(SymbolEvent::RetryAfterElapsed).await;
                    }
                }
                _ => {}
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn current_state(&self) -> Option<SymbolState> {
        self.dispatcher.status(&self.symbol).map(|s| s.state.clone())
    }

    async fn try_fetch(&self, now_ms: i64) {
        if self.global_backoff.is_armed(now_ms) {
            self.counters.record_snapshot_skip(now_ms);
            info!(symbol = %self.symbol, reason = "SNAPSHOT_SKIP_GLOBAL", "snapshot attempt skipped, global backoff armed");
            return;
        }
        if !self.symbol_backoff.may_attempt(now_ms, self.snapshot_min_interval_ms) {
            self.counters.record_snapshot_skip(now_ms);
            return;
        }
        self.symbol_backoff.record_attempt(now_ms);

        match self.fetcher.fetch(&self.symbol, self.depth_levels).await {
            FetchOutcome::Snapshot(snap) => {
                self.symbol_backoff.reset();
                self.counters.record_snapshot_ok(now_ms);
                self.handle.send(SymbolEvent::SnapshotReady(snap)).await;
            }
            FetchOutcome::RateLimited { retry_after_secs } => {
                self.global_backoff.arm(now_ms, retry_after_secs);
                self.symbol_backoff.double();
                warn!(symbol = %self.symbol, retry_after_secs, "resync supervisor backing off on rate limit");
                self.handle.send(SymbolEvent::SnapshotRateLimited { retry_after_secs }).await;
            }
            FetchOutcome::Errored => {
                self.symbol_backoff.double();
                info!(symbol = %self.symbol, "resync supervisor snapshot attempt failed, will retry");
                self.handle.send(SymbolEvent::SnapshotErrored).await;
            }
        }
    }
}
