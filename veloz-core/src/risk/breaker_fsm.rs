//! Typestate state machine for the account/symbol circuit breaker.
//!
//! ```text
//!     CLOSED ──fail(N)──→ OPEN ──timeout──→ HALFOPEN
//!        ▲                                      │
//!        │                success(M)            │
//!        └──────────────────────────────────────┘
//!                            │
//!                           fail
//!                            ▼
//!                          OPEN
//! ```
//!
//! Closed and HalfOpen allow calls; Open rejects until its timeout elapses.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerData {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub timeout_duration: Duration,
    pub failure_count: u64,
    pub success_count: u64,
    pub total_opens: u64,
    pub last_state_change: Instant,
    pub opened_at: Option<Instant>,
}

impl BreakerData {
    pub fn new(failure_threshold: u64, success_threshold: u64, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout_duration: timeout,
            failure_count: 0,
            success_count: 0,
            total_opens: 0,
            last_state_change: Instant::now(),
            opened_at: None,
        }
    }

    pub fn is_timeout_expired(&self) -> bool {
        self.opened_at
            .map(|opened| opened.elapsed() >= self.timeout_duration)
            .unwrap_or(false)
    }
}

/// Normal operation. Calls are permitted.
#[derive(Debug, Clone)]
pub struct Closed {
    data: BreakerData,
}

impl Closed {
    pub fn new(failure_threshold: u64, success_threshold: u64, timeout: Duration) -> Self {
        Self {
            data: BreakerData::new(failure_threshold, success_threshold, timeout),
        }
    }

    pub fn data(&self) -> &BreakerData {
        &self.data
    }

    pub fn record_success(mut self) -> Self {
        self.data.failure_count = 0;
        self
    }

    pub fn record_failure(mut self) -> ClosedOrOpen {
        self.data.failure_count += 1;
        if self.data.failure_count >= self.data.failure_threshold {
            self.data.total_opens += 1;
            self.data.opened_at = Some(Instant::now());
            self.data.last_state_change = Instant::now();
            ClosedOrOpen::Open(Open { data: self.data })
        } else {
            ClosedOrOpen::Closed(self)
        }
    }
}

/// Tripped. Calls are rejected until the timeout elapses.
#[derive(Debug, Clone)]
pub struct Open {
    data: BreakerData,
}

impl Open {
    pub fn data(&self) -> &BreakerData {
        &self.data
    }

    /// Trip directly to OPEN from any prior state, bypassing the normal
    /// failure-threshold count. Used for hard-stop safety conditions (a
    /// durability failure, a panic storm) that must not wait for N
    /// threshold-counted failures to accumulate first.
    pub fn forced(failure_threshold: u64, success_threshold: u64, timeout: Duration) -> Self {
        let mut data = BreakerData::new(failure_threshold, success_threshold, timeout);
        data.total_opens += 1;
        data.opened_at = Some(Instant::now());
        data.last_state_change = Instant::now();
        Self { data }
    }

    pub fn check_timeout(mut self) -> OpenOrHalfOpen {
        if self.data.is_timeout_expired() {
            self.data.success_count = 0;
            self.data.last_state_change = Instant::now();
            OpenOrHalfOpen::HalfOpen(HalfOpen { data: self.data })
        } else {
            OpenOrHalfOpen::Open(self)
        }
    }
}

/// Probing recovery. A single failure sends the breaker back to Open.
#[derive(Debug, Clone)]
pub struct HalfOpen {
    data: BreakerData,
}

impl HalfOpen {
    pub fn data(&self) -> &BreakerData {
        &self.data
    }

    pub fn record_success(mut self) -> HalfOpenOrClosed {
        self.data.success_count += 1;
        if self.data.success_count >= self.data.success_threshold {
            self.data.failure_count = 0;
            self.data.success_count = 0;
            self.data.opened_at = None;
            self.data.last_state_change = Instant::now();
            HalfOpenOrClosed::Closed(Closed { data: self.data })
        } else {
            HalfOpenOrClosed::HalfOpen(self)
        }
    }

    pub fn record_failure(mut self) -> Open {
        self.data.total_opens += 1;
        self.data.opened_at = Some(Instant::now());
        self.data.last_state_change = Instant::now();
        self.data.success_count = 0;
        Open { data: self.data }
    }
}

pub enum ClosedOrOpen {
    Closed(Closed),
    Open(Open),
}

pub enum OpenOrHalfOpen {
    Open(Open),
    HalfOpen(HalfOpen),
}

pub enum HalfOpenOrClosed {
    HalfOpen(HalfOpen),
    Closed(Closed),
}

/// Type-erased breaker state, stored behind a lock by `BreakerHandle`.
#[derive(Debug, Clone)]
pub enum BreakerState {
    Closed(Closed),
    Open(Open),
    HalfOpen(HalfOpen),
}

impl BreakerState {
    pub fn state_name(&self) -> &'static str {
        match self {
            BreakerState::Closed(_) => "CLOSED",
            BreakerState::Open(_) => "OPEN",
            BreakerState::HalfOpen(_) => "HALF_OPEN",
        }
    }
}

impl From<Closed> for BreakerState {
    fn from(c: Closed) -> Self {
        BreakerState::Closed(c)
    }
}

impl From<Open> for BreakerState {
    fn from(o: Open) -> Self {
        BreakerState::Open(o)
    }
}

impl From<HalfOpen> for BreakerState {
    fn from(h: HalfOpen) -> Self {
        BreakerState::HalfOpen(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn closed_opens_after_threshold() {
        let mut breaker = Closed::new(3, 2, Duration::from_secs(1));
        breaker = match breaker.record_failure() {
            ClosedOrOpen::Closed(c) => c,
            ClosedOrOpen::Open(_) => panic!("should not open yet"),
        };
        breaker = match breaker.record_failure() {
            ClosedOrOpen::Closed(c) => c,
            ClosedOrOpen::Open(_) => panic!("should not open yet"),
        };
        match breaker.record_failure() {
            ClosedOrOpen::Open(o) => assert_eq!(o.data().total_opens, 1),
            ClosedOrOpen::Closed(_) => panic!("should be open"),
        }
    }

    #[test]
    fn open_transitions_to_half_open_after_timeout() {
        let breaker = Closed::new(1, 2, Duration::from_millis(10));
        let breaker = match breaker.record_failure() {
            ClosedOrOpen::Open(o) => o,
            _ => panic!(),
        };
        thread::sleep(Duration::from_millis(15));
        match breaker.check_timeout() {
            OpenOrHalfOpen::HalfOpen(_) => {}
            OpenOrHalfOpen::Open(_) => panic!("should be half-open"),
        }
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = Closed::new(1, 2, Duration::from_millis(10));
        let breaker = match breaker.record_failure() {
            ClosedOrOpen::Open(o) => o,
            _ => panic!(),
        };
        thread::sleep(Duration::from_millis(15));
        let breaker = match breaker.check_timeout() {
            OpenOrHalfOpen::HalfOpen(h) => h,
            _ => panic!(),
        };
        let breaker = breaker.record_failure();
        assert_eq!(breaker.data().total_opens, 2);
    }

    #[test]
    fn forced_open_bypasses_failure_threshold() {
        let breaker = Open::forced(100, 2, Duration::from_millis(10));
        assert_eq!(breaker.data().total_opens, 1);
        assert!(breaker.data().opened_at.is_some());
        thread::sleep(Duration::from_millis(15));
        match breaker.check_timeout() {
            OpenOrHalfOpen::HalfOpen(_) => {}
            OpenOrHalfOpen::Open(_) => panic!("should time out like any other open breaker"),
        }
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = Closed::new(1, 2, Duration::from_millis(10));
        let breaker = match breaker.record_failure() {
            ClosedOrOpen::Open(o) => o,
            _ => panic!(),
        };
        thread::sleep(Duration::from_millis(15));
        let mut breaker = match breaker.check_timeout() {
            OpenOrHalfOpen::HalfOpen(h) => h,
            _ => panic!(),
        };
        breaker = match breaker.record_success() {
            HalfOpenOrClosed::HalfOpen(h) => h,
            HalfOpenOrClosed::Closed(_) => panic!("should stay half-open"),
        };
        match breaker.record_success() {
            HalfOpenOrClosed::Closed(c) => assert_eq!(c.data().failure_count, 0),
            HalfOpenOrClosed::HalfOpen(_) => panic!("should be closed"),
        }
    }
}
