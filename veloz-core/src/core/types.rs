//! Core entity types: orders, balances, positions, and market events.
//!
//! Amounts (`order_qty`, `limit_price`, `executed_qty`, `avg_price`,
//! balances, position quantities) are `rust_decimal::Decimal` rather than the
//! teacher's hot-path fixed-point `i64`/`u64` integers: the auditable,
//! deterministic decimal arithmetic the spec calls for (at least 8
//! fractional digits, byte-identical replay) is a better fit than raw
//! throughput here. The teacher's `u64` fixed-point scheme is kept below in
//! [`fixed_point`] as documented reference, unused by the rest of the crate.

use crate::core::ids::{ClientOrderId, VenueOrderId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => anyhow::bail!("unrecognized side: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl std::str::FromStr for OrderType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "LIMIT" => Ok(OrderType::Limit),
            "MARKET" => Ok(OrderType::Market),
            other => anyhow::bail!("unrecognized order type: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl std::str::FromStr for TimeInForce {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "GTC" => Ok(TimeInForce::Gtc),
            "IOC" => Ok(TimeInForce::Ioc),
            "FOK" => Ok(TimeInForce::Fok),
            other => anyhow::bail!("unrecognized time in force: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFlags {
    pub reduce_only: bool,
    pub post_only: bool,
}

/// Order lifecycle state. The DAG in `core::order_fsm` is the only place
/// transitions between these are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Rejected
                | OrderStatus::Cancelled
                | OrderStatus::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// An order, owned exclusively by Engine State and keyed by `client_order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: ClientOrderId,
    pub venue_order_id: Option<VenueOrderId>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub order_qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub flags: OrderFlags,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
    pub state: OrderStatus,
    pub reason: Option<String>,
    pub created_ns: i64,
    pub last_update_ns: i64,
}

impl Order {
    pub fn remaining_qty(&self) -> Decimal {
        self.order_qty - self.executed_qty
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, OrderStatus::Accepted | OrderStatus::PartiallyFilled)
    }
}

/// Balance of one asset for one account. Invariant: `free + locked =
/// total_asset_held`; enforced by construction — every mutation goes through
/// `reserve` / `release` / `settle`, never direct field writes, in
/// `engine::state`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(free: Decimal) -> Self {
        Self {
            free,
            locked: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self {
            free: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// Per-symbol position. Created lazily on first non-zero exposure; side
/// flips are modeled as close-then-open with realized PnL computed on the
/// closed leg, in `engine::state::EngineState::apply_fill`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn flat() -> Self {
        Self {
            qty: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn side(&self) -> PositionSide {
        if self.qty > Decimal::ZERO {
            PositionSide::Long
        } else if self.qty < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Flat
        }
    }

    /// Unrealized PnL against `mark`, derived from the last observed price.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        self.qty * (mark - self.avg_entry_price)
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

/// Market data the core consumes directly (`price`, `ts_ns`); other fields
/// are forwarded opaquely to strategies, which are out of scope here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketEvent {
    Trade {
        symbol: String,
        price: Decimal,
        qty: Decimal,
        ts_ns: i64,
    },
    BookTop {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        ts_ns: i64,
    },
    BookDelta {
        symbol: String,
        #[serde(flatten)]
        payload: serde_json::Value,
        ts_ns: i64,
    },
    Kline {
        symbol: String,
        #[serde(flatten)]
        payload: serde_json::Value,
        ts_ns: i64,
    },
    Ticker {
        symbol: String,
        #[serde(flatten)]
        payload: serde_json::Value,
        ts_ns: i64,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade { symbol, .. }
            | MarketEvent::BookTop { symbol, .. }
            | MarketEvent::BookDelta { symbol, .. }
            | MarketEvent::Kline { symbol, .. }
            | MarketEvent::Ticker { symbol, .. } => symbol,
        }
    }

    pub fn ts_ns(&self) -> i64 {
        match self {
            MarketEvent::Trade { ts_ns, .. }
            | MarketEvent::BookTop { ts_ns, .. }
            | MarketEvent::BookDelta { ts_ns, .. }
            | MarketEvent::Kline { ts_ns, .. }
            | MarketEvent::Ticker { ts_ns, .. } => *ts_ns,
        }
    }

    /// Reference price for risk checks, where available.
    pub fn mark(&self) -> Option<Decimal> {
        match self {
            MarketEvent::Trade { price, .. } => Some(*price),
            MarketEvent::BookTop { bid, ask, .. } => Some((*bid + *ask) / Decimal::TWO),
            _ => None,
        }
    }
}

/// The teacher's hot-path fixed-point scheme (SCALE = 1e9), kept for
/// reference; the engine's own types use `Decimal` (see module docs).
pub mod fixed_point {
    use crate::core::errors::ConversionError;

    pub const SCALE: i64 = 1_000_000_000;
    pub const MAX_SAFE_F64: f64 = (i64::MAX / SCALE) as f64;
    pub const MIN_SAFE_F64: f64 = (i64::MIN / SCALE) as f64;

    #[inline(always)]
    pub fn from_f64(value: f64) -> i64 {
        (value * SCALE as f64) as i64
    }

    #[inline(always)]
    pub fn from_f64_checked(value: f64) -> Result<i64, ConversionError> {
        if value.is_nan() {
            return Err(ConversionError::NotANumber);
        }
        if value.is_infinite() {
            return Err(ConversionError::Infinite {
                positive: value > 0.0,
            });
        }
        if value > MAX_SAFE_F64 || value < MIN_SAFE_F64 {
            return Err(ConversionError::OutOfRange { value });
        }
        Ok((value * SCALE as f64) as i64)
    }

    #[inline(always)]
    pub fn to_f64(value: i64) -> f64 {
        value as f64 / SCALE as f64
    }

    #[inline(always)]
    pub fn from_u64_checked(value: u64) -> Result<i64, ConversionError> {
        if value > i64::MAX as u64 {
            let f64_val = value as f64 / SCALE as f64;
            return Err(ConversionError::OutOfRange { value: f64_val });
        }
        Ok(value as i64)
    }

    #[inline(always)]
    pub fn from_u64(value: u64) -> i64 {
        value as i64
    }

    #[inline(always)]
    pub fn to_u64(value: i64) -> u64 {
        value.max(0) as u64
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trips_through_f64() {
            let fp = from_f64_checked(50_000.123456789).unwrap();
            assert!((to_f64(fp) - 50_000.123456789).abs() < 1e-6);
        }

        #[test]
        fn rejects_nan_and_infinite() {
            assert!(from_f64_checked(f64::NAN).is_err());
            assert!(from_f64_checked(f64::INFINITY).is_err());
        }
    }
}
