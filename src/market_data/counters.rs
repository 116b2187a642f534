// =============================================================================
// Rolling Counters — prune-on-read event windows, 10s / 60s
// =============================================================================
//
// Shared by every component that needs a "how many X happened in the last
// N seconds" answer: depth messages, desyncs, snapshot OKs/skips, broadcast
// reasons. A single ring of timestamps per event kind, pruned lazily on
// read rather than on a timer.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;

/// A single named rolling window of event timestamps (epoch millis).
#[derive(Debug, Default)]
struct Window {
    timestamps: VecDeque<i64>,
}

impl Window {
    fn record(&mut self, now_ms: i64) {
        self.timestamps.push_back(now_ms);
    }

    fn prune(&mut self, now_ms: i64, horizon_ms: i64) {
        while let Some(&front) = self.timestamps.front() {
            if now_ms - front > horizon_ms {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&mut self, now_ms: i64, horizon_ms: i64) -> usize {
        self.prune(now_ms, horizon_ms);
        self.timestamps.len()
    }
}

/// Named rolling counters for one symbol (or the process, for global ones).
/// Every `record_*` call prunes to 60s on insert so the ring never grows
/// unbounded even if nobody reads it.
pub struct RollingCounters {
    depth_msgs: RwLock<Window>,
    desyncs: RwLock<Window>,
    snapshot_ok: RwLock<Window>,
    snapshot_skip: RwLock<Window>,
    broadcasts: RwLock<Window>,
}

const SIXTY_S_MS: i64 = 60_000;
const TEN_S_MS: i64 = 10_000;

impl Default for RollingCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingCounters {
    pub fn new() -> Self {
        Self {
            depth_msgs: RwLock::new(Window::default()),
            desyncs: RwLock::new(Window::default()),
            snapshot_ok: RwLock::new(Window::default()),
            snapshot_skip: RwLock::new(Window::default()),
            broadcasts: RwLock::new(Window::default()),
        }
    }

    fn record(window: &RwLock<Window>, now_ms: i64) {
        let mut w = window.write();
        w.record(now_ms);
        w.prune(now_ms, SIXTY_S_MS);
    }

    pub fn record_depth_msg(&self, now_ms: i64) {
        Self::record(&self.depth_msgs, now_ms);
    }

    pub fn record_desync(&self, now_ms: i64) {
        Self::record(&self.desyncs, now_ms);
    }

    pub fn record_snapshot_ok(&self, now_ms: i64) {
        Self::record(&self.snapshot_ok, now_ms);
    }

    pub fn record_snapshot_skip(&self, now_ms: i64) {
        Self::record(&self.snapshot_skip, now_ms);
    }

    pub fn record_broadcast(&self, now_ms: i64) {
        Self::record(&self.broadcasts, now_ms);
    }

    pub fn desyncs_10s(&self, now_ms: i64) -> usize {
        self.desyncs.write().count(now_ms, TEN_S_MS)
    }

    pub fn desyncs_60s(&self, now_ms: i64) -> usize {
        self.desyncs.write().count(now_ms, SIXTY_S_MS)
    }

    pub fn depth_msgs_10s(&self, now_ms: i64) -> usize {
        self.depth_msgs.write().count(now_ms, TEN_S_MS)
    }

    pub fn snapshot_ok_60s(&self, now_ms: i64) -> usize {
        self.snapshot_ok.write().count(now_ms, SIXTY_S_MS)
    }

    pub fn snapshot_skip_60s(&self, now_ms: i64) -> usize {
        self.snapshot_skip.write().count(now_ms, SIXTY_S_MS)
    }

    pub fn broadcasts_10s(&self, now_ms: i64) -> usize {
        self.broadcasts.write().count(now_ms, TEN_S_MS)
    }
}

/// Rolling 60s boolean samples used for `live_uptime_pct_60s`.
#[derive(Debug, Default)]
pub struct LiveSamples {
    samples: VecDeque<(i64, bool)>,
}

impl LiveSamples {
    pub fn record(&mut self, now_ms: i64, live: bool) {
        self.samples.push_back((now_ms, live));
        while let Some(&(ts, _)) = self.samples.front() {
            if now_ms - ts > SIXTY_S_MS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mean over boolean samples taken in the last 60s, in `[0, 100]`.
    /// An empty window (no observations yet) reports `0`.
    pub fn live_pct_60s(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let live = self.samples.iter().filter(|(_, l)| *l).count();
        (live as f64 / self.samples.len() as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_entries_older_than_window() {
        let c = RollingCounters::new();
        c.record_desync(0);
        c.record_desync(5_000);
        c.record_desync(15_000);
        assert_eq!(c.desyncs_10s(15_000), 2); // 5_000 and 15_000 within 10s
        assert_eq!(c.desyncs_60s(15_000), 3);
    }

    #[test]
    fn live_pct_all_clean_converges_to_100() {
        let mut ls = LiveSamples::default();
        for t in (0..60_000).step_by(1_000) {
            ls.record(t, true);
        }
        assert!((ls.live_pct_60s() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn live_pct_bounded_0_100() {
        let mut ls = LiveSamples::default();
        ls.record(0, true);
        ls.record(1_000, false);
        ls.record(2_000, true);
        let pct = ls.live_pct_60s();
        assert!((0.0..=100.0).contains(&pct));
    }
}
