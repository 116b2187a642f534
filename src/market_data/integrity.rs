// =============================================================================
// Integrity Monitor — per-symbol health classification
// =============================================================================
//
// A small struct recomputed on every observation: EWMA inter-message gap,
// a never-merged gap counter (kept separate from the Applier's desync
// counter fed into `RollingCounters`, see SPEC_FULL.md §9), and a
// three-tier classification consumed by the state machine and `/status`.
// =============================================================================

const EWMA_ALPHA: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityLevel {
    Ok,
    Degraded,
    Critical,
}

impl IntegrityLevel {
    pub fn is_critical(&self) -> bool {
        matches!(self, IntegrityLevel::Critical)
    }
}

impl std::fmt::Display for IntegrityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug)]
pub struct IntegrityMonitor {
    ewma_gap_ms: f64,
    last_message_ms: Option<i64>,
    last_snapshot_refresh_ms: Option<i64>,
    gap_count: u64,
    last_reconnect_ms: Option<i64>,
}

/// Staleness threshold above which we consider the feed degraded even
/// without a hard gap (no new message for this long).
const DEGRADED_EWMA_MULTIPLIER: f64 = 5.0;
const CRITICAL_EWMA_MULTIPLIER: f64 = 15.0;
/// Snapshot staleness threshold driving `Trigger::SnapshotFreshnessLost`.
const SNAPSHOT_STALE_MS: i64 = 5 * 60_000;
/// Minimum time between two reconnect attempts for the same symbol.
const RECONNECT_COOLDOWN_MS: i64 = 10_000;

impl Default for IntegrityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityMonitor {
    pub fn new() -> Self {
        Self {
            ewma_gap_ms: 100.0,
            last_message_ms: None,
            last_snapshot_refresh_ms: None,
            gap_count: 0,
            last_reconnect_ms: None,
        }
    }

    pub fn record_message(&mut self, now_ms: i64) {
        if let Some(last) = self.last_message_ms {
            let gap = (now_ms - last).max(0) as f64;
            self.ewma_gap_ms = EWMA_ALPHA * self.ewma_gap_ms + (1.0 - EWMA_ALPHA) * gap;
        }
        self.last_message_ms = Some(now_ms);
    }

    pub fn record_gap(&mut self) {
        self.gap_count += 1;
    }

    pub fn record_snapshot_refresh(&mut self) {
        self.last_snapshot_refresh_ms = self.last_message_ms;
    }

    /// `true` if the replica has been populated by a snapshot but hasn't
    /// been refreshed in `fresh_ms` (spec §4.4: "snapshot freshness lost
    /// while the book is populated"). `fresh_ms` is threaded in from
    /// `RuntimeConfig::live_snapshot_fresh_ms` rather than hardcoded.
    pub fn is_snapshot_stale(&self, now_ms: i64, fresh_ms: i64) -> bool {
        match self.last_snapshot_refresh_ms {
            Some(t) => now_ms - t > fresh_ms,
            None => false,
        }
    }

    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }

    pub fn ewma_gap_ms(&self) -> f64 {
        self.ewma_gap_ms
    }

    /// `true` if `now_ms` is far enough past the last reconnect to attempt
    /// another one without thrashing.
    pub fn reconnect_allowed(&self, now_ms: i64) -> bool {
        match self.last_reconnect_ms {
            Some(last) => now_ms - last >= RECONNECT_COOLDOWN_MS,
            None => true,
        }
    }

    pub fn record_reconnect(&mut self, now_ms: i64) {
        self.last_reconnect_ms = Some(now_ms);
    }

    pub fn classify(&self, now_ms: i64) -> IntegrityLevel {
        let silence_ms = match self.last_message_ms {
            Some(last) => (now_ms - last).max(0) as f64,
            None => return IntegrityLevel::Degraded,
        };

        let snapshot_stale = self
            .last_snapshot_refresh_ms
            .map(|t| now_ms - t > SNAPSHOT_STALE_MS)
            .unwrap_or(false);

        if silence_ms > self.ewma_gap_ms * CRITICAL_EWMA_MULTIPLIER || snapshot_stale {
            IntegrityLevel::Critical
        } else if silence_ms > self.ewma_gap_ms * DEGRADED_EWMA_MULTIPLIER {
            IntegrityLevel::Degraded
        } else {
            IntegrityLevel::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_monitor_with_no_messages_is_degraded_not_ok() {
        let monitor = IntegrityMonitor::new();
        assert_eq!(monitor.classify(1_000), IntegrityLevel::Degraded);
    }

    #[test]
    fn steady_messages_stay_ok() {
        let mut monitor = IntegrityMonitor::new();
        for t in (0..10_000).step_by(100) {
            monitor.record_message(t);
        }
        assert_eq!(monitor.classify(9_900 + 50), IntegrityLevel::Ok);
    }

    #[test]
    fn long_silence_becomes_critical() {
        let mut monitor = IntegrityMonitor::new();
        for t in (0..1_000).step_by(100) {
            monitor.record_message(t);
        }
        assert_eq!(monitor.classify(1_000 + 60_000), IntegrityLevel::Critical);
    }

    #[test]
    fn stale_snapshot_forces_critical_even_with_fresh_messages() {
        let mut monitor = IntegrityMonitor::new();
        monitor.record_message(0);
        monitor.record_snapshot_refresh();
        monitor.record_message(1_000);
        assert_eq!(monitor.classify(1_000 + SNAPSHOT_STALE_MS + 1), IntegrityLevel::Critical);
    }

    #[test]
    fn reconnect_cooldown_blocks_rapid_retries() {
        let mut monitor = IntegrityMonitor::new();
        assert!(monitor.reconnect_allowed(0));
        monitor.record_reconnect(0);
        assert!(!monitor.reconnect_allowed(5_000));
        assert!(monitor.reconnect_allowed(10_000));
    }
}
