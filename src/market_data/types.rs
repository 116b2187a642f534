// =============================================================================
// Wire-level market data types — depth diffs, snapshots, trades
// =============================================================================

use std::cmp::Ordering;
use serde::{Deserialize, Serialize};

/// A price used as a `BTreeMap` key. Prices arrive from the venue as decimal
/// strings; we keep them as `f64` but never compare them with `==` — `Ord`
/// is total because order-book prices are always finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PriceKey(pub f64);

impl Eq for PriceKey {}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

impl From<f64> for PriceKey {
    fn from(v: f64) -> Self {
        PriceKey(v)
    }
}

/// One price level update: `(price, quantity)`. A quantity of `0.0` deletes
/// the level.
pub type Level = (f64, f64);

/// An incremental depth update from the venue, `U..u` inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthDiff {
    /// First sequence id covered by this diff.
    pub u_first: u64,
    /// Last sequence id covered by this diff.
    pub u_last: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub event_time_ms: i64,
    #[serde(skip, default = "now_ms")]
    pub receipt_time_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A full order-book snapshot pulled over REST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Which side of the tape a trade's taker was on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Binance reports `m` (`is_buyer_maker`); the taker is the opposite side.
    pub fn from_is_buyer_maker(is_buyer_maker: bool) -> Self {
        if is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub price: f64,
    pub qty: f64,
    pub side: Side,
    pub event_time_ms: i64,
}

// ---------------------------------------------------------------------------
// Wire envelopes — combined-stream JSON parsing
// ---------------------------------------------------------------------------

/// Parse a `depthUpdate` frame from the combined stream payload.
///
/// Expected shape: `{"e":"depthUpdate","E":evt,"s":sym,"U":u1,"u":u2,"b":[[p,q]],"a":[[p,q]]}`.
pub fn parse_depth_update(data: &serde_json::Value) -> anyhow::Result<(String, DepthDiff)> {
    use anyhow::Context;

    let symbol = data["s"]
        .as_str()
        .context("depthUpdate missing field s")?
        .to_uppercase();
    let u_first = data["U"].as_u64().context("depthUpdate missing field U")?;
    let u_last = data["u"].as_u64().context("depthUpdate missing field u")?;
    let event_time_ms = data["E"].as_i64().unwrap_or_default();

    let bids = parse_levels(&data["b"])?;
    let asks = parse_levels(&data["a"])?;

    Ok((
        symbol,
        DepthDiff {
            u_first,
            u_last,
            bids,
            asks,
            event_time_ms,
            receipt_time_ms: now_ms(),
        },
    ))
}

/// Parse a `trade` frame: `{"e":"trade","s":sym,"T":evt,"p":px,"q":qty,"m":bool}`.
pub fn parse_trade(data: &serde_json::Value) -> anyhow::Result<(String, Trade)> {
    use anyhow::Context;

    let symbol = data["s"].as_str().context("trade missing field s")?.to_uppercase();
    let price: f64 = data["p"]
        .as_str()
        .context("trade missing field p")?
        .parse()
        .context("failed to parse trade price")?;
    let qty: f64 = data["q"]
        .as_str()
        .context("trade missing field q")?
        .parse()
        .context("failed to parse trade qty")?;
    let is_buyer_maker = data["m"].as_bool().context("trade missing field m")?;
    let event_time_ms = data["T"].as_i64().unwrap_or_default();

    Ok((
        symbol,
        Trade {
            price,
            qty,
            side: Side::from_is_buyer_maker(is_buyer_maker),
            event_time_ms,
        },
    ))
}

pub fn parse_levels(val: &serde_json::Value) -> anyhow::Result<Vec<Level>> {
    let arr = val.as_array().cloned().unwrap_or_default();
    let mut out = Vec::with_capacity(arr.len());
    for entry in &arr {
        let pair = entry.as_array().ok_or_else(|| anyhow::anyhow!("level is not an array"))?;
        let price: f64 = pair
            .first()
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("level missing price"))?;
        let qty: f64 = pair
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("level missing qty"))?;
        out.push((price, qty));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_key_orders_like_f64() {
        let mut keys = vec![PriceKey(3.0), PriceKey(1.0), PriceKey(2.0)];
        keys.sort();
        assert_eq!(keys, vec![PriceKey(1.0), PriceKey(2.0), PriceKey(3.0)]);
    }

    #[test]
    fn side_from_maker_flag() {
        assert_eq!(Side::from_is_buyer_maker(true), Side::Sell);
        assert_eq!(Side::from_is_buyer_maker(false), Side::Buy);
    }

    #[test]
    fn parse_depth_update_ok() {
        let json = serde_json::json!({
            "e": "depthUpdate", "E": 123, "s": "btcusdt",
            "U": 100, "u": 105,
            "b": [["10.0", "1.5"]],
            "a": [["10.2", "2.0"]],
        });
        let (sym, diff) = parse_depth_update(&json).unwrap();
        assert_eq!(sym, "BTCUSDT");
        assert_eq!(diff.u_first, 100);
        assert_eq!(diff.u_last, 105);
        assert_eq!(diff.bids, vec![(10.0, 1.5)]);
    }

    #[test]
    fn parse_trade_ok() {
        let json = serde_json::json!({
            "e": "trade", "s": "ETHUSDT", "T": 555,
            "p": "2000.5", "q": "0.25", "m": true,
        });
        let (sym, trade) = parse_trade(&json).unwrap();
        assert_eq!(sym, "ETHUSDT");
        assert_eq!(trade.side, Side::Sell);
        assert!((trade.price - 2000.5).abs() < f64::EPSILON);
    }
}
