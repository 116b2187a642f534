// =============================================================================
// Book Replica — bid/ask price ladders with venue sequence discipline
// =============================================================================
//
// Each symbol owns exactly one `BookReplica`, held inside that symbol's
// actor. Prices are kept in `BTreeMap`s so that best-bid/best-ask and
// top-N views are cheap ordered reads; quantities of zero remove the level.
//
// Sequence discipline follows the venue's `U`/`u` diff protocol: a diff is
// contiguous against the replica iff `U == last_applied + 1`. See `apply`
// and `apply_snapshot` for the exact rules.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use super::types::{DepthDiff, Level, PriceKey, Snapshot};

/// Result of applying a single diff to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The diff was contiguous and has been merged into the book.
    Applied,
    /// `u <= last_applied`; the diff was already reflected, discarded as a no-op.
    AlreadyReflected,
    /// `U > last_applied + 1`; a sequence gap was detected and nothing was applied.
    Gap,
}

/// Result of applying a snapshot plus replaying the buffered-diff queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub applied_count: usize,
    pub dropped_count: usize,
    pub gap_detected: bool,
}

/// Bid/ask price ladders for one symbol plus sequence bookkeeping.
#[derive(Debug, Clone)]
pub struct BookReplica {
    bids: BTreeMap<PriceKey, f64>,
    asks: BTreeMap<PriceKey, f64>,
    last_update_id: u64,
    last_applied: Option<u64>,
}

impl Default for BookReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl BookReplica {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            last_applied: None,
        }
    }

    pub fn last_applied_sequence(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    fn apply_levels(side: &mut BTreeMap<PriceKey, f64>, levels: &[Level]) {
        for &(price, qty) in levels {
            if qty <= 0.0 {
                side.remove(&PriceKey(price));
            } else {
                side.insert(PriceKey(price), qty);
            }
        }
    }

    /// Apply a single diff per the sequence discipline in spec §4.2.
    ///
    /// With `last = last_applied_sequence()`:
    /// - `u <= last`   -> already reflected, no-op.
    /// - `U <= last+1 <= u` -> apply, `last_applied = u`.
    /// - `U > last+1`  -> gap; caller decides whether to buffer (only while
    ///   `APPLYING_SNAPSHOT`) or declare a desync.
    pub fn apply(&mut self, diff: &DepthDiff) -> ApplyOutcome {
        let last = match self.last_applied {
            Some(l) => l,
            None => {
                // No snapshot seeded yet: never mis-apply. Caller is expected
                // to only invoke `apply` once a snapshot has established a
                // baseline; treat an unseeded apply as a gap.
                return ApplyOutcome::Gap;
            }
        };

        if diff.u_last <= last {
            return ApplyOutcome::AlreadyReflected;
        }
        if diff.u_first > last + 1 {
            return ApplyOutcome::Gap;
        }

        Self::apply_levels(&mut self.bids, &diff.bids);
        Self::apply_levels(&mut self.asks, &diff.asks);
        self.last_applied = Some(diff.u_last);
        ApplyOutcome::Applied
    }

    /// Reset the replica from a full snapshot, then replay the buffered diff
    /// queue against it per spec §4.2:
    /// - drop any buffered diff with `u <= last_update_id`;
    /// - apply (in order) any buffered diff with `U <= last_update_id+1 <= u`;
    /// - if the first remaining buffered diff would still leave a gap, report
    ///   `gap_detected` so the caller transitions to RESYNCING.
    pub fn apply_snapshot(&mut self, snap: Snapshot, buffered: &mut VecDeque<DepthDiff>) -> SnapshotOutcome {
        self.bids.clear();
        self.asks.clear();
        for &(price, qty) in &snap.bids {
            if qty > 0.0 {
                self.bids.insert(PriceKey(price), qty);
            }
        }
        for &(price, qty) in &snap.asks {
            if qty > 0.0 {
                self.asks.insert(PriceKey(price), qty);
            }
        }
        self.last_update_id = snap.last_update_id;
        self.last_applied = Some(snap.last_update_id);

        let mut applied_count = 0;
        let mut dropped_count = 0;
        let mut gap_detected = false;

        while let Some(diff) = buffered.pop_front() {
            if diff.u_last <= self.last_update_id {
                dropped_count += 1;
                continue;
            }
            let last = self.last_applied.unwrap_or(self.last_update_id);
            if diff.u_first > last + 1 {
                gap_detected = true;
                // Put it back; the caller decides what to do with the
                // remaining tail (typically: keep buffering under RESYNCING
                // or discard on the next snapshot attempt).
                buffered.push_front(diff);
                break;
            }
            Self::apply_levels(&mut self.bids, &diff.bids);
            Self::apply_levels(&mut self.asks, &diff.asks);
            self.last_applied = Some(diff.u_last);
            applied_count += 1;
        }

        SnapshotOutcome {
            applied_count,
            dropped_count,
            gap_detected,
        }
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, &q)| (p.0, q))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, &q)| (p.0, q))
    }

    pub fn level_size(&self, price: f64, is_bid: bool) -> Option<f64> {
        let side = if is_bid { &self.bids } else { &self.asks };
        side.get(&PriceKey(price)).copied()
    }

    /// Top `n` levels, descending bids then ascending asks.
    pub fn top_levels(&self, n: usize) -> (Vec<Level>, Vec<Level>) {
        let bids = self.bids.iter().rev().take(n).map(|(p, &q)| (p.0, q)).collect();
        let asks = self.asks.iter().take(n).map(|(p, &q)| (p.0, q)).collect();
        (bids, asks)
    }

    /// A crossed book (best bid >= best ask) is a detectable fault, not an
    /// invariant violation at the data-structure level.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.last_applied.is_some()
    }

    /// No price should ever map to a non-positive quantity (invariant #2).
    #[cfg(test)]
    fn no_zero_levels(&self) -> bool {
        self.bids.values().all(|&q| q > 0.0) && self.asks.values().all(|&q| q > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(u_first: u64, u_last: u64, bids: Vec<Level>, asks: Vec<Level>) -> DepthDiff {
        DepthDiff {
            u_first,
            u_last,
            bids,
            asks,
            event_time_ms: 0,
            receipt_time_ms: 0,
        }
    }

    fn snap(last_update_id: u64, bids: Vec<Level>, asks: Vec<Level>) -> Snapshot {
        Snapshot {
            last_update_id,
            bids,
            asks,
        }
    }

    // S1: Clean seed.
    #[test]
    fn s1_clean_seed() {
        let mut book = BookReplica::new();
        let mut buf = VecDeque::new();
        let out = book.apply_snapshot(snap(100, vec![(10.0, 1.0)], vec![(10.2, 1.0)]), &mut buf);
        assert_eq!(out.applied_count, 0);
        assert_eq!(out.dropped_count, 0);
        assert!(!out.gap_detected);

        let d = diff(101, 101, vec![(10.0, 1.5)], vec![]);
        assert_eq!(book.apply(&d), ApplyOutcome::Applied);
        assert_eq!(book.last_applied_sequence(), Some(101));
        assert_eq!(book.best_bid(), Some((10.0, 1.5)));
        assert!(book.no_zero_levels());
    }

    // S2: Buffered diffs across snapshot.
    #[test]
    fn s2_buffered_diffs_across_snapshot() {
        let mut book = BookReplica::new();
        let mut buf = VecDeque::new();
        // diffs U=90..120 in steps of one each covering a single sequence id.
        for u in 90..=120u64 {
            buf.push_back(diff(u, u, vec![(1.0 + u as f64 * 0.0, 1.0)], vec![]));
        }
        let out = book.apply_snapshot(snap(105, vec![(10.0, 1.0)], vec![(10.2, 1.0)]), &mut buf);
        // dropped: u <= 105 -> u in 90..=105 inclusive = 16 entries.
        assert_eq!(out.dropped_count, 16);
        // applied: u in 106..=120 inclusive = 15 entries.
        assert_eq!(out.applied_count, 15);
        assert!(!out.gap_detected);
    }

    #[test]
    fn already_reflected_diff_is_noop() {
        let mut book = BookReplica::new();
        let mut buf = VecDeque::new();
        book.apply_snapshot(snap(100, vec![(10.0, 1.0)], vec![]), &mut buf);
        let d = diff(50, 100, vec![(99.0, 5.0)], vec![]);
        assert_eq!(book.apply(&d), ApplyOutcome::AlreadyReflected);
        assert_eq!(book.level_size(99.0, true), None);
    }

    // S3: sequence gap.
    #[test]
    fn s3_sequence_gap_detected() {
        let mut book = BookReplica::new();
        let mut buf = VecDeque::new();
        book.apply_snapshot(snap(100, vec![(10.0, 1.0)], vec![]), &mut buf);
        let d = diff(200, 205, vec![], vec![]);
        assert_eq!(book.apply(&d), ApplyOutcome::Gap);
        // Book must be unchanged.
        assert_eq!(book.last_applied_sequence(), Some(100));
    }

    #[test]
    fn zero_qty_diff_deletes_level() {
        let mut book = BookReplica::new();
        let mut buf = VecDeque::new();
        book.apply_snapshot(snap(100, vec![(10.0, 1.0)], vec![]), &mut buf);
        let d = diff(101, 101, vec![(10.0, 0.0)], vec![]);
        assert_eq!(book.apply(&d), ApplyOutcome::Applied);
        assert_eq!(book.best_bid(), None);
        assert!(book.no_zero_levels());
    }

    #[test]
    fn empty_book_best_prices_are_none() {
        let book = BookReplica::new();
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn top_levels_ordering() {
        let mut book = BookReplica::new();
        let mut buf = VecDeque::new();
        book.apply_snapshot(
            snap(1, vec![(10.0, 1.0), (9.0, 1.0), (11.0, 1.0)], vec![(12.0, 1.0), (13.0, 1.0)]),
            &mut buf,
        );
        let (bids, asks) = book.top_levels(2);
        assert_eq!(bids, vec![(11.0, 1.0), (10.0, 1.0)]);
        assert_eq!(asks, vec![(12.0, 1.0), (13.0, 1.0)]);
    }

    #[test]
    fn unseeded_apply_is_gap_never_misapplied() {
        let mut book = BookReplica::new();
        let d = diff(1, 1, vec![(10.0, 1.0)], vec![]);
        assert_eq!(book.apply(&d), ApplyOutcome::Gap);
        assert!(!book.is_seeded());
    }

    #[test]
    fn reapplying_snapshot_equivalent_to_replaying_buffered_subset() {
        // Applying a snapshot with lastUpdateId = L, then replaying buffered
        // diffs with u <= L, is equivalent to applying just the snapshot.
        let mut a = BookReplica::new();
        let mut buf_a = VecDeque::new();
        a.apply_snapshot(snap(50, vec![(10.0, 1.0)], vec![(10.5, 2.0)]), &mut buf_a);

        let mut b = BookReplica::new();
        let mut buf_b = VecDeque::new();
        buf_b.push_back(diff(10, 20, vec![(9.0, 9.0)], vec![]));
        buf_b.push_back(diff(21, 50, vec![(8.0, 8.0)], vec![]));
        b.apply_snapshot(snap(50, vec![(10.0, 1.0)], vec![(10.5, 2.0)]), &mut buf_b);

        assert_eq!(a.best_bid(), b.best_bid());
        assert_eq!(a.best_ask(), b.best_ask());
        assert_eq!(a.last_applied_sequence(), b.last_applied_sequence());
    }
}
