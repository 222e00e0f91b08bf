//! Account (and optionally per-symbol) circuit breaker.
//!
//! Wraps the [`crate::risk::breaker_fsm`] typestate machine behind a mutex so
//! the Risk Engine can call `is_call_permitted` / `record_success` /
//! `record_failure` from the single dispatcher thread without matching on the
//! state by hand. Three consecutive rejections open the account breaker by
//! default; a dedicated per-symbol map can be enabled for venues that isolate
//! failures by instrument.

use crate::risk::breaker_fsm::{
    BreakerState, Closed, ClosedOrOpen, HalfOpenOrClosed, Open, OpenOrHalfOpen,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A single CLOSED/OPEN/HALF_OPEN breaker guarded by a mutex.
pub struct BreakerHandle {
    state: Mutex<BreakerState>,
}

impl BreakerHandle {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        let closed = Closed::new(
            config.failure_threshold,
            config.success_threshold,
            config.timeout,
        );
        Self {
            state: Mutex::new(BreakerState::Closed(closed)),
        }
    }

    /// Resolve any pending Open → HalfOpen timeout, then report whether a
    /// call may proceed.
    pub fn is_call_permitted(&self) -> bool {
        let mut guard = self.state.lock();
        if let BreakerState::Open(_) = &*guard {
            let open = match std::mem::replace(
                &mut *guard,
                BreakerState::Closed(Closed::new(1, 1, Duration::from_secs(0))),
            ) {
                BreakerState::Open(o) => o,
                _ => unreachable!(),
            };
            *guard = match open.check_timeout() {
                OpenOrHalfOpen::Open(o) => BreakerState::Open(o),
                OpenOrHalfOpen::HalfOpen(h) => {
                    info!("circuit breaker: OPEN -> HALF_OPEN (timeout elapsed)");
                    BreakerState::HalfOpen(h)
                }
            };
        }
        matches!(
            &*guard,
            BreakerState::Closed(_) | BreakerState::HalfOpen(_)
        )
    }

    pub fn record_success(&self) {
        let mut guard = self.state.lock();
        let taken = std::mem::replace(
            &mut *guard,
            BreakerState::Closed(Closed::new(1, 1, Duration::from_secs(0))),
        );
        *guard = match taken {
            BreakerState::Closed(c) => BreakerState::Closed(c.record_success()),
            BreakerState::HalfOpen(h) => match h.record_success() {
                HalfOpenOrClosed::HalfOpen(h) => BreakerState::HalfOpen(h),
                HalfOpenOrClosed::Closed(c) => {
                    info!("circuit breaker: HALF_OPEN -> CLOSED");
                    BreakerState::Closed(c)
                }
            },
            open @ BreakerState::Open(_) => open,
        };
    }

    pub fn record_failure(&self) {
        let mut guard = self.state.lock();
        let taken = std::mem::replace(
            &mut *guard,
            BreakerState::Closed(Closed::new(1, 1, Duration::from_secs(0))),
        );
        *guard = match taken {
            BreakerState::Closed(c) => match c.record_failure() {
                ClosedOrOpen::Closed(c) => BreakerState::Closed(c),
                ClosedOrOpen::Open(o) => {
                    warn!("circuit breaker: CLOSED -> OPEN (failure threshold reached)");
                    BreakerState::Open(o)
                }
            },
            BreakerState::HalfOpen(h) => {
                warn!("circuit breaker: HALF_OPEN -> OPEN (probe failed)");
                BreakerState::Open(h.record_failure())
            }
            open @ BreakerState::Open(_) => open,
        };
    }

    pub fn state(&self) -> CircuitState {
        match &*self.state.lock() {
            BreakerState::Closed(_) => CircuitState::Closed,
            BreakerState::Open(_) => CircuitState::Open,
            BreakerState::HalfOpen(_) => CircuitState::HalfOpen,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.lock().state_name()
    }

    /// Trip directly to OPEN, bypassing the failure-threshold count, for a
    /// hard-stop safety condition rather than an ordinary counted failure.
    pub fn force_open(&self, failure_threshold: u64, success_threshold: u64, timeout: Duration) {
        let mut guard = self.state.lock();
        *guard = BreakerState::Open(Open::forced(failure_threshold, success_threshold, timeout));
    }
}

/// Breaker registry: one breaker per account, with an optional per-symbol
/// breaker map layered on top (spec: "per-account with per-symbol optional").
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    account: BreakerHandle,
    per_symbol: Mutex<HashMap<String, Arc<BreakerHandle>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            account: BreakerHandle::new(&config),
            per_symbol: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Call is permitted only if both the account breaker and (if a symbol is
    /// given) the symbol breaker are not open.
    pub fn is_call_permitted(&self, symbol: Option<&str>) -> bool {
        if !self.account.is_call_permitted() {
            return false;
        }
        if let Some(symbol) = symbol {
            self.symbol_handle(symbol).is_call_permitted()
        } else {
            true
        }
    }

    /// Per-symbol events (`symbol = Some(..)`) record only against that
    /// symbol's breaker; account-wide events (`symbol = None`) record only
    /// against the account breaker. The two are isolated signals — a run of
    /// failures on one instrument must not trip every other instrument's
    /// orders along with it.
    pub fn record_success(&self, symbol: Option<&str>) {
        match symbol {
            Some(symbol) => self.symbol_handle(symbol).record_success(),
            None => self.account.record_success(),
        }
    }

    pub fn record_failure(&self, symbol: Option<&str>) {
        match symbol {
            Some(symbol) => self.symbol_handle(symbol).record_failure(),
            None => self.account.record_failure(),
        }
    }

    pub fn account_state(&self) -> CircuitState {
        self.account.state()
    }

    /// Trip the account breaker straight to OPEN, bypassing its
    /// failure-threshold count, for a hard-stop safety condition.
    pub fn force_open_account(&self) {
        self.account
            .force_open(self.config.failure_threshold, self.config.success_threshold, self.config.timeout);
    }

    /// Trip a symbol's breaker straight to OPEN, bypassing its
    /// failure-threshold count.
    pub fn force_open_symbol(&self, symbol: &str) {
        self.symbol_handle(symbol).force_open(
            self.config.failure_threshold,
            self.config.success_threshold,
            self.config.timeout,
        );
    }

    fn symbol_handle(&self, symbol: &str) -> Arc<BreakerHandle> {
        let mut map = self.per_symbol.lock();
        map.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(BreakerHandle::new(&self.config)))
            .clone()
    }
}
