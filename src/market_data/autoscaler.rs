// =============================================================================
// Autoscaler — adjusts the active-symbol budget from rolling live-uptime
// =============================================================================
//
// Every second, averages `live_uptime_pct_60s` across active symbols. Below
// `DOWN_PCT` forces the budget to 1 symbol; above `UP_PCT` held for
// `UP_HOLD_MS` grows the budget by one. Only trims what `Fanout` actually
// requested — symbols pinned by the paper-trading collaborator are never
// dropped. Drop order is lexicographic on the active set, tail trimmed
// first (SPEC_FULL.md §9: confirmed as the implemented contract).
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub const DOWN_PCT: f64 = 60.0;
pub const UP_PCT: f64 = 95.0;
pub const UP_HOLD_MS: i64 = 30_000;

/// Shared, process-wide budget on the number of concurrently active
/// symbols. Read by whatever owns symbol lifecycle (the process's main
/// supervising loop) to decide which symbols stay subscribed.
#[derive(Debug, Default)]
pub struct ActiveSymbolBudget {
    value: AtomicUsize,
}

impl ActiveSymbolBudget {
    pub fn new(initial: usize) -> Self {
        Self {
            value: AtomicUsize::new(initial.max(1)),
        }
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    fn set(&self, v: usize) {
        self.value.store(v.max(1), Ordering::Relaxed);
    }
}

/// A symbol's live-uptime input, collected once per tick by whoever
/// supervises the actors.
pub struct SymbolUptime {
    pub symbol: String,
    pub live_pct_60s: f64,
}

pub struct Autoscaler {
    budget: Arc<ActiveSymbolBudget>,
    above_up_pct_since_ms: AtomicI64,
}

/// Outcome of one tick: the new budget, and which symbols (if any) must be
/// dropped from the active set to honor it.
#[derive(Debug, Default, PartialEq)]
pub struct ScaleDecision {
    pub new_budget: usize,
    pub dropped: Vec<String>,
}

impl Autoscaler {
    pub fn new(budget: Arc<ActiveSymbolBudget>) -> Self {
        Self {
            budget,
            above_up_pct_since_ms: AtomicI64::new(-1),
        }
    }

    pub fn budget(&self) -> Arc<ActiveSymbolBudget> {
        self.budget.clone()
    }

    /// One evaluation tick. `active` is the current active set (any order);
    /// `pinned` are symbols the paper-trading collaborator holds positions
    /// in and must never be trimmed.
    pub fn evaluate(&self, now_ms: i64, uptimes: &[SymbolUptime], pinned: &[String]) -> ScaleDecision {
        if uptimes.is_empty() {
            return ScaleDecision {
                new_budget: self.budget.get(),
                dropped: Vec::new(),
            };
        }

        let mean: f64 = uptimes.iter().map(|u| u.live_pct_60s).sum::<f64>() / uptimes.len() as f64;
        let current = self.budget.get();

        let target = if mean < DOWN_PCT {
            self.above_up_pct_since_ms.store(-1, Ordering::Relaxed);
            1
        } else if mean > UP_PCT {
            let since = self.above_up_pct_since_ms.load(Ordering::Relaxed);
            if since < 0 {
                self.above_up_pct_since_ms.store(now_ms, Ordering::Relaxed);
                current
            } else if now_ms - since >= UP_HOLD_MS {
                current + 1
            } else {
                current
            }
        } else {
            self.above_up_pct_since_ms.store(-1, Ordering::Relaxed);
            current
        };

        self.budget.set(target);

        let dropped = if target < uptimes.len() {
            self.select_drops(uptimes, pinned, uptimes.len() - target)
        } else {
            Vec::new()
        };

        if !dropped.is_empty() {
            info!(new_budget = target, dropped = ?dropped, "autoscaler trimmed active symbol set");
        }

        ScaleDecision {
            new_budget: target,
            dropped,
        }
    }

    /// Lexicographic order on the active set, tail trimmed first, skipping
    /// anything in `pinned`.
    fn select_drops(&self, uptimes: &[SymbolUptime], pinned: &[String], how_many: usize) -> Vec<String> {
        let mut symbols: Vec<&str> = uptimes
            .iter()
            .map(|u| u.symbol.as_str())
            .filter(|s| !pinned.iter().any(|p| p == s))
            .collect();
        symbols.sort();
        let drop_count = how_many.min(symbols.len());
        symbols[symbols.len() - drop_count..]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

pub fn tick_interval() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uptime(symbol: &str, pct: f64) -> SymbolUptime {
        SymbolUptime {
            symbol: symbol.to_string(),
            live_pct_60s: pct,
        }
    }

    // S6: 5 symbols active, mean livePct60s=55%, budget=5.
    // Expect budget -> 1, 4 symbols dropped, lexicographic order.
    #[test]
    fn s6_autoscale_down() {
        let budget = Arc::new(ActiveSymbolBudget::new(5));
        let scaler = Autoscaler::new(budget.clone());
        let uptimes = vec![
            uptime("BTCUSDT", 55.0),
            uptime("ETHUSDT", 55.0),
            uptime("SOLUSDT", 55.0),
            uptime("ADAUSDT", 55.0),
            uptime("BNBUSDT", 55.0),
        ];
        let decision = scaler.evaluate(0, &uptimes, &[]);
        assert_eq!(decision.new_budget, 1);
        assert_eq!(budget.get(), 1);
        let mut dropped = decision.dropped.clone();
        dropped.sort();
        assert_eq!(
            dropped,
            vec![
                "BNBUSDT".to_string(),
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ]
        );
        assert!(!decision.dropped.contains(&"ADAUSDT".to_string()));
    }

    #[test]
    fn pinned_symbols_are_never_dropped() {
        let budget = Arc::new(ActiveSymbolBudget::new(3));
        let scaler = Autoscaler::new(budget);
        let uptimes = vec![uptime("AAAUSDT", 10.0), uptime("BBBUSDT", 10.0), uptime("ZZZUSDT", 10.0)];
        let decision = scaler.evaluate(0, &uptimes, &["ZZZUSDT".to_string()]);
        assert_eq!(decision.new_budget, 1);
        assert!(!decision.dropped.contains(&"ZZZUSDT".to_string()));
    }

    #[test]
    fn scale_up_requires_sustained_hold() {
        let budget = Arc::new(ActiveSymbolBudget::new(2));
        let scaler = Autoscaler::new(budget.clone());
        let uptimes = vec![uptime("BTCUSDT", 99.0), uptime("ETHUSDT", 99.0)];
        let d1 = scaler.evaluate(0, &uptimes, &[]);
        assert_eq!(d1.new_budget, 2); // not yet held long enough
        let d2 = scaler.evaluate(UP_HOLD_MS, &uptimes, &[]);
        assert_eq!(d2.new_budget, 3);
    }

    #[test]
    fn mid_band_leaves_budget_unchanged() {
        let budget = Arc::new(ActiveSymbolBudget::new(4));
        let scaler = Autoscaler::new(budget.clone());
        let uptimes = vec![uptime("BTCUSDT", 80.0)];
        let decision = scaler.evaluate(0, &uptimes, &[]);
        assert_eq!(decision.new_budget, 4);
        assert!(decision.dropped.is_empty());
    }
}
