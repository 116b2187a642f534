// =============================================================================
// Snapshot Fetcher + Global Backoff — REST seeding of the order book
// =============================================================================
//
// Pulls `GET /fapi/v1/depth` to seed or re-seed a symbol's book. Backoff is
// tracked two ways, mirroring the donor's rate-limit tracker idiom
// (atomic counters anyone can read lock-free) but applied to snapshot
// cadence instead of order weight:
//
//   - `GlobalBackoff`: process-wide gate armed by any 429/418, so every
//     symbol backs off together rather than hammering the venue in turn.
//   - per-symbol backoff: doubles on error, capped at MAX, reset to MIN
//     on a clean apply.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use anyhow::Context;
use tracing::{instrument, warn};

use super::types::{parse_levels, Snapshot};

pub const MIN_BACKOFF_MS: u64 = 1_000;
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Process-wide rate-limit gate. Armed by a 429/418 response; every symbol
/// consults it before attempting a snapshot fetch of its own.
#[derive(Debug, Default)]
pub struct GlobalBackoff {
    /// Epoch-millis timestamp before which no snapshot fetch should be
    /// attempted by anyone. `0` means not armed.
    gate_until_ms: AtomicI64,
}

impl GlobalBackoff {
    pub fn new() -> Self {
        Self {
            gate_until_ms: AtomicI64::new(0),
        }
    }

    /// Arm the gate for `retry_after_secs` from `now_ms`.
    pub fn arm(&self, now_ms: i64, retry_after_secs: u64) {
        let until = now_ms + (retry_after_secs as i64 * 1000);
        self.gate_until_ms.fetch_max(until, Ordering::Relaxed);
    }

    /// `true` if the global gate still blocks attempts at `now_ms`.
    pub fn is_armed(&self, now_ms: i64) -> bool {
        now_ms < self.gate_until_ms.load(Ordering::Relaxed)
    }

    pub fn gate_until_ms(&self) -> i64 {
        self.gate_until_ms.load(Ordering::Relaxed)
    }
}

/// Per-symbol backoff and attempt bookkeeping.
#[derive(Debug)]
pub struct SymbolBackoff {
    current_ms: AtomicU64,
    last_attempt_ms: AtomicI64,
    consecutive_errors: AtomicU64,
}

impl Default for SymbolBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolBackoff {
    pub fn new() -> Self {
        Self {
            current_ms: AtomicU64::new(MIN_BACKOFF_MS),
            last_attempt_ms: AtomicI64::new(0),
            consecutive_errors: AtomicU64::new(0),
        }
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// `max(minIntervalMs, symbolBackoff)` must have elapsed since the last
    /// attempt, per spec §4.3.
    pub fn may_attempt(&self, now_ms: i64, min_interval_ms: u64) -> bool {
        let last = self.last_attempt_ms.load(Ordering::Relaxed);
        let gap_required = self.current_ms.load(Ordering::Relaxed).max(min_interval_ms) as i64;
        now_ms - last >= gap_required
    }

    pub fn record_attempt(&self, now_ms: i64) {
        self.last_attempt_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn double(&self) {
        self.current_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some((cur.saturating_mul(2)).min(MAX_BACKOFF_MS))
            })
            .ok();
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.current_ms.store(MIN_BACKOFF_MS, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }
}

/// The outcome of one `SnapshotFetcher::fetch` call, driving the caller's
/// state-machine transition.
#[derive(Debug)]
pub enum FetchOutcome {
    /// HTTP 429/418. Global gate armed, symbol halted.
    RateLimited { retry_after_secs: u64 },
    /// Any other non-2xx response or transport error.
    Errored,
    /// 2xx with a parsed snapshot body.
    Snapshot(Snapshot),
}

/// Thin REST client for `GET /fapi/v1/depth`, reusing a shared `reqwest`
/// client the way the donor's `BinanceClient` does for signed endpoints.
pub struct SnapshotFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl SnapshotFetcher {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    #[instrument(skip(self), fields(symbol = %symbol))]
    pub async fn fetch(&self, symbol: &str, limit: u32) -> FetchOutcome {
        let url = format!("{}/fapi/v1/depth", self.base_url);
        let resp = match self
            .http
            .get(&url)
            .query(&[("symbol", symbol), ("limit", &limit.to_string())])
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "snapshot request failed at the transport layer");
                return FetchOutcome::Errored;
            }
        };

        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after_secs = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            warn!(status = %status, retry_after_secs, "snapshot fetch rate-limited");
            return FetchOutcome::RateLimited { retry_after_secs };
        }

        if !status.is_success() {
            warn!(status = %status, "snapshot fetch returned non-OK status");
            return FetchOutcome::Errored;
        }

        match self.parse_body(resp).await {
            Ok(snap) => FetchOutcome::Snapshot(snap),
            Err(err) => {
                warn!(error = %err, "failed to parse snapshot body");
                FetchOutcome::Errored
            }
        }
    }

    async fn parse_body(&self, resp: reqwest::Response) -> anyhow::Result<Snapshot> {
        let body: serde_json::Value = resp.json().await.context("snapshot body not valid JSON")?;
        let last_update_id = body["lastUpdateId"]
            .as_u64()
            .context("snapshot missing lastUpdateId")?;
        let bids = parse_levels(&body["bids"])?;
        let asks = parse_levels(&body["asks"])?;
        Ok(Snapshot {
            last_update_id,
            bids,
            asks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_backoff_gates_until_armed_window_elapses() {
        let gate = GlobalBackoff::new();
        assert!(!gate.is_armed(0));
        gate.arm(0, 60);
        assert!(gate.is_armed(1_000));
        assert!(gate.is_armed(59_999));
        assert!(!gate.is_armed(60_000));
    }

    #[test]
    fn global_backoff_arm_never_shrinks_the_gate() {
        let gate = GlobalBackoff::new();
        gate.arm(0, 60);
        gate.arm(1_000, 1); // would expire sooner; must not shrink the gate
        assert!(gate.is_armed(2_000));
        assert_eq!(gate.gate_until_ms(), 60_000);
    }

    #[test]
    fn symbol_backoff_doubles_and_caps() {
        let b = SymbolBackoff::new();
        assert_eq!(b.current_ms(), MIN_BACKOFF_MS);
        for _ in 0..20 {
            b.double();
        }
        assert_eq!(b.current_ms(), MAX_BACKOFF_MS);
        assert_eq!(b.consecutive_errors(), 20);
    }

    #[test]
    fn symbol_backoff_resets_to_min_on_success() {
        let b = SymbolBackoff::new();
        b.double();
        b.double();
        assert!(b.current_ms() > MIN_BACKOFF_MS);
        b.reset();
        assert_eq!(b.current_ms(), MIN_BACKOFF_MS);
        assert_eq!(b.consecutive_errors(), 0);
    }

    #[test]
    fn symbol_backoff_respects_min_interval_floor() {
        let b = SymbolBackoff::new();
        b.record_attempt(0);
        // current_ms is MIN_BACKOFF_MS (1000); min_interval_ms of 5000 should win.
        assert!(!b.may_attempt(2_000, 5_000));
        assert!(b.may_attempt(5_000, 5_000));
    }
}
