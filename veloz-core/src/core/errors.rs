//! Domain-specific error types.
//!
//! [`RejectReason`] is the engine's reject/error taxonomy (surfaced verbatim
//! in `order_update{status=REJECTED, reason}` and `error` events): a `Copy`
//! enum with a `Display` impl and an `as_str()` code, in the same style as
//! the teacher's `RiskViolation`/`PreTradeRejection` enums. `OverflowError`,
//! `ConversionError`, and `PositionError` are kept from the teacher verbatim
//! as the error types for the `fixed_point` module retained in
//! `core::types` for reference.

use std::fmt;

/// Reject/error reason codes, exactly the taxonomy enumerated by the
/// external interface contract. `Display` renders the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ParseError,
    DuplicateClientOrderId,
    InsufficientFunds,
    PriceOutOfBand,
    OrderSizeOutOfRange,
    OrderRateExceeded,
    MaxPositionExceeded,
    MaxLeverageExceeded,
    StateInvalid,
    NotFound,
    CircuitBreakerOpen,
    ReplicationOverflow,
    VenueUnreachable,
    WalDurabilityFailed,
}

impl RejectReason {
    /// Whether this reason reflects market/account conditions worth feeding
    /// into the post-trade circuit breaker, as opposed to routine
    /// client-side validation noise (a malformed order, a duplicate id, a
    /// size outside policy bounds) that says nothing about venue or market
    /// health.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            RejectReason::MaxPositionExceeded
                | RejectReason::MaxLeverageExceeded
                | RejectReason::PriceOutOfBand
                | RejectReason::VenueUnreachable
                | RejectReason::WalDurabilityFailed
                | RejectReason::ReplicationOverflow
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ParseError => "parse_error",
            RejectReason::DuplicateClientOrderId => "duplicate_client_order_id",
            RejectReason::InsufficientFunds => "insufficient_funds",
            RejectReason::PriceOutOfBand => "price_out_of_band",
            RejectReason::OrderSizeOutOfRange => "order_size_out_of_range",
            RejectReason::OrderRateExceeded => "order_rate_exceeded",
            RejectReason::MaxPositionExceeded => "max_position_exceeded",
            RejectReason::MaxLeverageExceeded => "max_leverage_exceeded",
            RejectReason::StateInvalid => "state_invalid",
            RejectReason::NotFound => "not_found",
            RejectReason::CircuitBreakerOpen => "circuit_breaker_open",
            RejectReason::ReplicationOverflow => "replication_overflow",
            RejectReason::VenueUnreachable => "venue_unreachable",
            RejectReason::WalDurabilityFailed => "wal_durability_failed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for RejectReason {}

/// Errors that can occur during arithmetic operations on Position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverflowError {
    /// Overflow when updating position quantity
    QuantityOverflow {
        /// Current quantity before update
        old: i64,
        /// Delta that would cause overflow
        delta: i64,
    },

    /// Overflow when updating realized PnL
    RealizedPnlOverflow {
        /// Current PnL before update
        old: i64,
        /// Delta that would cause overflow
        delta: i64,
    },

    /// Overflow when updating daily PnL
    DailyPnlOverflow {
        /// Current daily PnL before update
        old: i64,
        /// Delta that would cause overflow
        delta: i64,
    },

    /// Overflow in trade count (rare, after 4 billion trades)
    TradeCountOverflow {
        /// Current count before increment
        old: u32,
    },
}

impl fmt::Display for OverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowError::QuantityOverflow { old, delta } => {
                write!(
                    f,
                    "Position quantity overflow: {} + {} would exceed i64 limits",
                    old, delta
                )
            }
            OverflowError::RealizedPnlOverflow { old, delta } => {
                write!(
                    f,
                    "Realized PnL overflow: {} + {} would exceed i64 limits",
                    old, delta
                )
            }
            OverflowError::DailyPnlOverflow { old, delta } => {
                write!(
                    f,
                    "Daily PnL overflow: {} + {} would exceed i64 limits",
                    old, delta
                )
            }
            OverflowError::TradeCountOverflow { old } => {
                write!(f, "Trade count overflow: {} trades (limit: u32::MAX)", old)
            }
        }
    }
}

impl std::error::Error for OverflowError {}

/// Errors that can occur during fixed-point conversions
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionError {
    /// Value is too large to represent in fixed-point
    OutOfRange {
        /// The value that couldn't be converted
        value: f64,
    },

    /// Value is NaN (not a valid price)
    NotANumber,

    /// Value is infinite (not a valid price)
    Infinite {
        /// Whether it's positive or negative infinity
        positive: bool,
    },

    /// Precision loss would be too significant
    PrecisionLoss {
        /// Original value
        original: f64,
        /// Converted value
        converted: f64,
        /// Difference in basis points
        error_bps: u64,
    },
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::OutOfRange { value } => {
                write!(
                    f,
                    "Value {} is out of range for fixed-point representation (max: ~9.2 quadrillion)",
                    value
                )
            }
            ConversionError::NotANumber => {
                write!(f, "Cannot convert NaN to fixed-point")
            }
            ConversionError::Infinite { positive } => {
                write!(
                    f,
                    "Cannot convert {} infinity to fixed-point",
                    if *positive { "positive" } else { "negative" }
                )
            }
            ConversionError::PrecisionLoss {
                original,
                converted,
                error_bps,
            } => {
                write!(
                    f,
                    "Precision loss too high: {} â†’ {} (error: {} bps)",
                    original, converted, error_bps
                )
            }
        }
    }
}

impl std::error::Error for ConversionError {}

/// Errors related to position state management
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// Position state is inconsistent (shouldn't happen)
    InconsistentState {
        /// Description of the inconsistency
        reason: String,
    },

    /// Position is locked for maintenance
    Locked,

    /// Overflow occurred (wraps OverflowError)
    Overflow(OverflowError),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::InconsistentState { reason } => {
                write!(f, "Position state inconsistent: {}", reason)
            }
            PositionError::Locked => {
                write!(f, "Position is locked for maintenance")
            }
            PositionError::Overflow(e) => {
                write!(f, "Position overflow: {}", e)
            }
        }
    }
}

impl std::error::Error for PositionError {}

impl From<OverflowError> for PositionError {
    fn from(e: OverflowError) -> Self {
        PositionError::Overflow(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_wire_codes() {
        assert_eq!(RejectReason::InsufficientFunds.as_str(), "insufficient_funds");
        assert_eq!(
            format!("{}", RejectReason::CircuitBreakerOpen),
            "circuit_breaker_open"
        );
    }

    #[test]
    fn test_counts_toward_breaker_excludes_routine_validation() {
        assert!(!RejectReason::InsufficientFunds.counts_toward_breaker());
        assert!(!RejectReason::OrderSizeOutOfRange.counts_toward_breaker());
        assert!(!RejectReason::DuplicateClientOrderId.counts_toward_breaker());
        assert!(RejectReason::MaxPositionExceeded.counts_toward_breaker());
        assert!(RejectReason::PriceOutOfBand.counts_toward_breaker());
        assert!(RejectReason::WalDurabilityFailed.counts_toward_breaker());
    }

    #[test]
    fn test_overflow_error_display() {
        let err = OverflowError::QuantityOverflow {
            old: i64::MAX - 100,
            delta: 200,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("overflow"));
        assert!(msg.contains("i64 limits"));
    }

    #[test]
    fn test_conversion_error_display() {
        let err = ConversionError::OutOfRange { value: 1e20 };
        let msg = format!("{}", err);
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_position_error_from_overflow() {
        let overflow = OverflowError::QuantityOverflow {
            old: 100,
            delta: 200,
        };
        let pos_err: PositionError = overflow.into();

        match pos_err {
            PositionError::Overflow(_) => {}
            _ => panic!("Expected Overflow variant"),
        }
    }
}
