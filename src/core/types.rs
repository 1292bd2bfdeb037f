//! Domain types shared across the client
//!
//! Wire payloads arrive as loosely-shaped JSON; these types carry the
//! subset the engine actually acts on, with forgiving `from_value`
//! constructors for the venue's two candle encodings.

use serde_json::Value;

/// Trade direction of a binary option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Call,
    Put,
}

impl Direction {
    /// Wire name used in the buyOption payload
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Call => "call",
            Direction::Put => "put",
        }
    }
}

/// Lifecycle status of a placed deal
///
/// Transitions exactly once from `Open` to a terminal value. `Unknown`
/// means the resolution window elapsed without a terminal push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStatus {
    Open,
    Won,
    Lost,
    Unknown,
}

impl DealStatus {
    /// Terminal statuses are immutable
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DealStatus::Open)
    }
}

/// One placed trade and its lifecycle until resolution
#[derive(Debug, Clone)]
pub struct Deal {
    pub id: u64,
    pub asset_id: u32,
    pub direction: Direction,
    pub amount: f64,
    /// Expiration in seconds
    pub expiration: u64,
    pub status: DealStatus,
    /// Profit reported by the terminal push, if any
    pub profit: Option<f64>,
}

impl Deal {
    /// Apply a terminal result. First terminal status wins; later results
    /// are ignored.
    pub fn resolve(&mut self, status: DealStatus, profit: Option<f64>) {
        if self.status == DealStatus::Open {
            self.status = status;
            self.profit = profit;
        }
    }
}

/// Tradable instrument as reported by the venue's `assets` response
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: u32,
    pub symbol: String,
    /// Payout percent for a winning trade
    pub payout: i64,
    pub is_active: bool,
}

impl Asset {
    /// Parse one entry of the `assets` array. Returns `None` when the
    /// entry lacks an id or symbol.
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            id: v.get("id")?.as_u64()? as u32,
            symbol: v.get("symbol")?.as_str()?.to_string(),
            payout: v.get("profit").and_then(Value::as_i64).unwrap_or(0),
            is_active: v.get("is_active").and_then(Value::as_i64).unwrap_or(0) == 1,
        })
    }

    /// Active and paying out
    pub fn is_tradable(&self) -> bool {
        self.is_active && self.payout > 0
    }
}

/// One OHLC candle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    /// UNIX timestamp (seconds)
    pub timestamp: i64,
    /// Timeframe in seconds
    pub timeframe: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// Parse a candle from either venue encoding:
    /// object `{"t": ts, "tf": period, "v": [o, h, l, c]}` or
    /// array `[ts, [o, h, l, c]]` (timeframe implied by the request).
    pub fn from_value(v: &Value, default_timeframe: u32) -> Option<Self> {
        match v {
            Value::Object(_) => {
                let timestamp = v.get("t")?.as_i64()?;
                let timeframe = v.get("tf")?.as_u64()? as u32;
                let ohlc = Self::ohlc(v.get("v")?)?;
                Some(Self::build(timestamp, timeframe, ohlc))
            }
            Value::Array(items) if items.len() >= 2 => {
                let timestamp = items[0].as_i64()?;
                let ohlc = Self::ohlc(&items[1])?;
                Some(Self::build(timestamp, default_timeframe, ohlc))
            }
            _ => None,
        }
    }

    fn ohlc(v: &Value) -> Option<[f64; 4]> {
        let arr = v.as_array()?;
        if arr.len() < 4 {
            return None;
        }
        Some([
            arr[0].as_f64()?,
            arr[1].as_f64()?,
            arr[2].as_f64()?,
            arr[3].as_f64()?,
        ])
    }

    fn build(timestamp: i64, timeframe: u32, [open, high, low, close]: [f64; 4]) -> Self {
        Self {
            timestamp,
            timeframe,
            open,
            high,
            low,
            close,
        }
    }
}
