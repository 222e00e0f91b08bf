//! Risk Engine: synchronous pre-trade validation plus the post-trade
//! circuit breaker.
//!
//! Every check is pure and side-effect free — [`RiskEngine::check_order`]
//! only reads the caller-supplied snapshot of balances/positions/policy
//! limits, mirroring the read-only capability Engine State grants it. The
//! circuit breaker is the one piece of mutable state the Risk Engine owns
//! directly; callers report outcomes into it via `record_acceptance` /
//! `record_rejection` after each decision.

pub mod breaker_fsm;
pub mod circuit_breaker;
pub mod fees;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fees::{BasisPointsFeePolicy, FeePolicy};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};

use crate::config::RiskConfig;
use crate::core::errors::RejectReason;
use crate::core::types::OrderType;
use rust_decimal::Decimal;

/// Snapshot of everything a single order-risk decision needs, gathered by
/// Engine State from its own maps before invoking the Risk Engine.
pub struct OrderRiskContext<'a> {
    pub symbol: &'a str,
    pub account: &'a str,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub mark: Decimal,
    /// Reservation this order would require, in the paying asset.
    pub required_reservation: Decimal,
    /// Free balance currently available in the paying asset.
    pub available_free: Decimal,
    /// Signed position quantity the account would hold for `symbol` after
    /// this order fully fills.
    pub position_after_qty: Decimal,
    /// Total notional exposure across the account after this order.
    pub total_notional_after: Decimal,
    pub equity: Decimal,
}

pub struct RiskEngine {
    config: RiskConfig,
    breaker: CircuitBreaker,
    symbol_rate: RateLimiter,
    account_rate: RateLimiter,
}

impl RiskEngine {
    pub fn new(config: RiskConfig, breaker_config: CircuitBreakerConfig) -> Self {
        let rate_config = RateLimiterConfig::new(config.order_rate_window_ms, config.order_rate_max);
        Self {
            config,
            breaker: CircuitBreaker::new(breaker_config),
            symbol_rate: RateLimiter::new(rate_config),
            account_rate: RateLimiter::new(rate_config),
        }
    }

    /// Run all pre-trade checks in the order listed in the policy table.
    /// The breaker gate runs first: an `OPEN` breaker rejects before any
    /// other check is evaluated, and acquiring rate-limiter slots is
    /// deferred until every other check has passed, so a rejected order
    /// never consumes rate budget.
    pub fn check_order(&self, ctx: &OrderRiskContext<'_>) -> Result<(), RejectReason> {
        if !self.breaker.is_call_permitted(Some(ctx.symbol)) {
            return Err(RejectReason::CircuitBreakerOpen);
        }

        if ctx.required_reservation > ctx.available_free {
            return Err(RejectReason::InsufficientFunds);
        }

        let max_position = self.config.max_position_for(ctx.symbol);
        if ctx.position_after_qty.abs() > max_position {
            return Err(RejectReason::MaxPositionExceeded);
        }

        if ctx.equity > Decimal::ZERO {
            let leverage = ctx.total_notional_after / ctx.equity;
            if leverage > self.config.max_leverage {
                return Err(RejectReason::MaxLeverageExceeded);
            }
        }

        if let Some(limit_price) = ctx.limit_price {
            if ctx.mark > Decimal::ZERO {
                let deviation = (limit_price - ctx.mark).abs() / ctx.mark;
                if deviation > self.config.max_price_deviation {
                    return Err(RejectReason::PriceOutOfBand);
                }
            }
        } else if ctx.order_type == OrderType::Market && ctx.mark > Decimal::ZERO {
            // MARKET orders have no explicit price; the worst-case fill is
            // bounded by the same deviation cap applied to the mark itself,
            // i.e. always within band by construction — nothing to check.
        }

        if ctx.qty < self.config.order_size_min || ctx.qty > self.config.order_size_max {
            return Err(RejectReason::OrderSizeOutOfRange);
        }

        if !self.symbol_rate.would_acquire(ctx.symbol) || !self.account_rate.would_acquire(ctx.account)
        {
            return Err(RejectReason::OrderRateExceeded);
        }
        self.symbol_rate.try_acquire(ctx.symbol);
        self.account_rate.try_acquire(ctx.account);

        Ok(())
    }

    /// Report a successful acceptance for the post-trade breaker: in
    /// `HALF_OPEN` this closes the breaker; in `CLOSED` it resets the
    /// consecutive-failure count.
    pub fn record_acceptance(&self, symbol: &str) {
        self.breaker.record_success(Some(symbol));
    }

    /// Report a rejection caused by market/account conditions (not a
    /// routine validation failure) for the post-trade breaker. Callers are
    /// expected to gate this on [`RejectReason::counts_toward_breaker`]
    /// before invoking it; this method trusts that judgment and always
    /// records.
    pub fn record_rejection(&self, symbol: &str) {
        self.breaker.record_failure(Some(symbol));
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Trip the account-wide breaker straight to OPEN for a hard-stop
    /// safety condition (durability failure, panic storm) rather than a
    /// counted, threshold-based failure.
    pub fn force_open_breaker(&self) {
        self.breaker.force_open_account();
    }

    /// The price-deviation cap, exposed so Engine State can size a MARKET
    /// order's worst-case reservation the same way this check bounds it.
    pub fn max_price_deviation(&self) -> Decimal {
        self.config.max_price_deviation
    }
}
