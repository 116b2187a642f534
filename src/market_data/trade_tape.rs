// =============================================================================
// Trade Tape — independent rolling trade windows
// =============================================================================
//
// Generalizes the donor's `TradeStreamProcessor` (`market_data/trade_stream.rs`,
// CVD / buy-sell ratio over a single implicit window) into four explicit
// rolling windows (1s/5s/10s/60s), each reporting prints/sec, trade count,
// aggressive buy/sell volume split, and the current consecutive-same-side
// streak. Never gated by `SymbolState` — trades flow regardless of book
// sync state.
// =============================================================================

use std::collections::VecDeque;

use super::types::{Side, Trade};

const WINDOWS_MS: [i64; 4] = [1_000, 5_000, 10_000, 60_000];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub window_ms: i64,
    pub trade_count: u64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub prints_per_sec: f64,
}

impl WindowMetrics {
    pub fn buy_volume_ratio(&self) -> f64 {
        let total = self.buy_volume + self.sell_volume;
        if total <= 0.0 {
            0.5
        } else {
            self.buy_volume / total
        }
    }
}

#[derive(Debug)]
struct TapeEntry {
    ts_ms: i64,
    trade: Trade,
}

#[derive(Debug)]
pub struct TradeTape {
    entries: VecDeque<TapeEntry>,
    last_side: Option<Side>,
    streak: u64,
    last_price: Option<f64>,
}

impl Default for TradeTape {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeTape {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_side: None,
            streak: 0,
            last_price: None,
        }
    }

    pub fn record(&mut self, trade: &Trade) {
        let now_ms = trade.event_time_ms;
        self.last_price = Some(trade.price);

        match self.last_side {
            Some(side) if side == trade.side => self.streak += 1,
            _ => self.streak = 1,
        }
        self.last_side = Some(trade.side);

        self.entries.push_back(TapeEntry {
            ts_ms: now_ms,
            trade: trade.clone(),
        });
        self.prune(now_ms);
    }

    fn prune(&mut self, now_ms: i64) {
        let horizon = WINDOWS_MS[WINDOWS_MS.len() - 1];
        while let Some(front) = self.entries.front() {
            if now_ms - front.ts_ms > horizon {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn consecutive_same_side_streak(&self) -> u64 {
        self.streak
    }

    pub fn metrics(&self, now_ms: i64, window_ms: i64) -> WindowMetrics {
        let mut trade_count = 0u64;
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;

        for entry in self.entries.iter().rev() {
            if now_ms - entry.ts_ms > window_ms {
                break;
            }
            trade_count += 1;
            match entry.trade.side {
                Side::Buy => buy_volume += entry.trade.qty,
                Side::Sell => sell_volume += entry.trade.qty,
            }
        }

        let prints_per_sec = trade_count as f64 / (window_ms as f64 / 1_000.0);

        WindowMetrics {
            window_ms,
            trade_count,
            buy_volume,
            sell_volume,
            prints_per_sec,
        }
    }

    /// All four standard windows, most granular first.
    pub fn all_metrics(&self, now_ms: i64) -> Vec<WindowMetrics> {
        WINDOWS_MS.iter().map(|&w| self.metrics(now_ms, w)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, qty: f64, side: Side, event_time_ms: i64) -> Trade {
        Trade {
            price,
            qty,
            side,
            event_time_ms,
        }
    }

    #[test]
    fn tracks_buy_sell_volume_split_within_window() {
        let mut tape = TradeTape::new();
        tape.record(&trade(100.0, 1.0, Side::Buy, 0));
        tape.record(&trade(100.0, 2.0, Side::Sell, 100));
        let m = tape.metrics(100, 1_000);
        assert_eq!(m.trade_count, 2);
        assert!((m.buy_volume - 1.0).abs() < f64::EPSILON);
        assert!((m.sell_volume - 2.0).abs() < f64::EPSILON);
        assert!((m.buy_volume_ratio() - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn prunes_entries_past_the_longest_window() {
        let mut tape = TradeTape::new();
        tape.record(&trade(100.0, 1.0, Side::Buy, 0));
        tape.record(&trade(100.0, 1.0, Side::Buy, 70_000));
        let m = tape.metrics(70_000, 60_000);
        assert_eq!(m.trade_count, 1);
    }

    #[test]
    fn consecutive_same_side_streak_resets_on_flip() {
        let mut tape = TradeTape::new();
        tape.record(&trade(100.0, 1.0, Side::Buy, 0));
        tape.record(&trade(100.0, 1.0, Side::Buy, 10));
        assert_eq!(tape.consecutive_same_side_streak(), 2);
        tape.record(&trade(100.0, 1.0, Side::Sell, 20));
        assert_eq!(tape.consecutive_same_side_streak(), 1);
    }

    #[test]
    fn empty_window_ratio_defaults_to_half() {
        let tape = TradeTape::new();
        let m = tape.metrics(0, 1_000);
        assert!((m.buy_volume_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
