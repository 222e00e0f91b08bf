//! Order state machine.
//!
//! The teacher models order lifecycle as a typestate (`OrderPending`,
//! `OrderOpen`, …) so illegal transitions are compile errors. Engine State
//! here must store heterogeneous orders in one `HashMap<ClientOrderId,
//! Order>`, so the same transition rules are instead implemented as methods
//! on a runtime `OrderStatus` tag that return `Result<_, RejectReason>` —
//! the validation logic (fill qty ≤ remaining, terminal-state rejection) is
//! carried over from the teacher's `FillError` checks.
//!
//! ```text
//!                    accept(risk ok)
//!   NEW ────────────────────────────────► ACCEPTED
//!    │                                     │
//!    │ reject(risk fail)                   │ partial_fill(qty<rem)
//!    ▼                                     ▼
//!  REJECTED                          PARTIALLY_FILLED
//!                                          │   │
//!                                          │   │ partial_fill(qty<rem)
//!                                          │   ▼
//!                                          │ (loop)
//!                                          │
//!                                          │ fill(qty=rem)
//!                                          ▼
//!                                        FILLED (terminal)
//!
//!  From {ACCEPTED, PARTIALLY_FILLED}:
//!    cancel_accepted ──► CANCELLED (terminal)
//!    expire          ──► EXPIRED   (terminal)
//! ```

use crate::core::errors::RejectReason;
use crate::core::types::{Order, OrderStatus};
use rust_decimal::Decimal;

/// Outcome of applying a fill, distinguishing a partial fill from the final
/// fill that closes the order — the caller needs this to know whether to
/// also update Position/Balance state as "order done".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Partial,
    Complete,
}

impl Order {
    /// NEW -> ACCEPTED. Valid only from `New`.
    pub fn accept(&mut self, now_ns: i64) -> Result<(), RejectReason> {
        if self.state != OrderStatus::New {
            return Err(RejectReason::StateInvalid);
        }
        self.state = OrderStatus::Accepted;
        self.last_update_ns = now_ns;
        Ok(())
    }

    /// NEW -> REJECTED. Valid only from `New`. Terminal.
    pub fn reject(&mut self, reason: RejectReason, now_ns: i64) -> Result<(), RejectReason> {
        if self.state != OrderStatus::New {
            return Err(RejectReason::StateInvalid);
        }
        self.state = OrderStatus::Rejected;
        self.reason = Some(reason.as_str().to_string());
        self.last_update_ns = now_ns;
        Ok(())
    }

    /// {ACCEPTED, PARTIALLY_FILLED} -> REJECTED. Terminal.
    ///
    /// Distinct from [`Order::reject`]: a `New` order being rejected never
    /// locked funds, so the FSM transition alone is enough. An order that
    /// already reached `Accepted`/`PartiallyFilled` holds a balance
    /// reservation the caller must release, which is why this is a
    /// separate method rather than a relaxed precondition on `reject`.
    pub fn reject_active(&mut self, reason: RejectReason, now_ns: i64) -> Result<(), RejectReason> {
        if !self.is_active() {
            return Err(RejectReason::StateInvalid);
        }
        self.state = OrderStatus::Rejected;
        self.reason = Some(reason.as_str().to_string());
        self.last_update_ns = now_ns;
        Ok(())
    }

    /// Apply a fill of `qty` at `price`. Valid from `Accepted` or
    /// `PartiallyFilled`; `qty` must be positive and not exceed the
    /// remaining quantity. Transitions to `Filled` when fully executed,
    /// otherwise `PartiallyFilled`.
    pub fn apply_fill(
        &mut self,
        qty: Decimal,
        price: Decimal,
        now_ns: i64,
    ) -> Result<FillOutcome, RejectReason> {
        if !matches!(self.state, OrderStatus::Accepted | OrderStatus::PartiallyFilled) {
            return Err(RejectReason::StateInvalid);
        }
        if qty <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(RejectReason::StateInvalid);
        }
        let remaining = self.remaining_qty();
        if qty > remaining {
            return Err(RejectReason::StateInvalid);
        }

        let prev_exec = self.executed_qty;
        let new_exec = prev_exec + qty;
        self.avg_price = if new_exec.is_zero() {
            Decimal::ZERO
        } else {
            (self.avg_price * prev_exec + price * qty) / new_exec
        };
        self.executed_qty = new_exec;
        self.last_update_ns = now_ns;

        if self.executed_qty == self.order_qty {
            self.state = OrderStatus::Filled;
            Ok(FillOutcome::Complete)
        } else {
            self.state = OrderStatus::PartiallyFilled;
            Ok(FillOutcome::Partial)
        }
    }

    /// {ACCEPTED, PARTIALLY_FILLED} -> CANCELLED. Terminal.
    pub fn cancel(&mut self, now_ns: i64) -> Result<(), RejectReason> {
        if !self.is_active() {
            return Err(RejectReason::StateInvalid);
        }
        self.state = OrderStatus::Cancelled;
        self.last_update_ns = now_ns;
        Ok(())
    }

    /// {ACCEPTED, PARTIALLY_FILLED} -> EXPIRED. Terminal.
    pub fn expire(&mut self, now_ns: i64) -> Result<(), RejectReason> {
        if !self.is_active() {
            return Err(RejectReason::StateInvalid);
        }
        self.state = OrderStatus::Expired;
        self.last_update_ns = now_ns;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ClientOrderId;
    use crate::core::types::{OrderFlags, OrderType, Side, TimeInForce};
    use rust_decimal_macros::dec;

    fn new_order(qty: Decimal) -> Order {
        Order {
            client_order_id: ClientOrderId::new("c1").unwrap(),
            venue_order_id: None,
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            order_qty: qty,
            limit_price: Some(dec!(50000)),
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::default(),
            executed_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            state: OrderStatus::New,
            reason: None,
            created_ns: 0,
            last_update_ns: 0,
        }
    }

    #[test]
    fn accept_then_full_fill_transitions_to_filled() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        assert_eq!(o.state, OrderStatus::Accepted);

        let outcome = o.apply_fill(dec!(1.0), dec!(50000), 2).unwrap();
        assert_eq!(outcome, FillOutcome::Complete);
        assert_eq!(o.state, OrderStatus::Filled);
        assert_eq!(o.avg_price, dec!(50000));
    }

    #[test]
    fn partial_fills_average_price_correctly() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        o.apply_fill(dec!(0.4), dec!(50000), 2).unwrap();
        let outcome = o.apply_fill(dec!(0.6), dec!(50100), 3).unwrap();
        assert_eq!(outcome, FillOutcome::Complete);
        // (50000*0.4 + 50100*0.6) / 1.0 = 50060
        assert_eq!(o.avg_price, dec!(50060));
    }

    #[test]
    fn fill_exceeding_remaining_is_rejected() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        o.apply_fill(dec!(0.5), dec!(50000), 2).unwrap();
        assert_eq!(
            o.apply_fill(dec!(0.6), dec!(50000), 3),
            Err(RejectReason::StateInvalid)
        );
    }

    #[test]
    fn cancel_is_rejected_once_terminal() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        o.apply_fill(dec!(1.0), dec!(50000), 2).unwrap();
        assert_eq!(o.cancel(3), Err(RejectReason::StateInvalid));
    }

    #[test]
    fn reject_only_valid_from_new() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        assert_eq!(
            o.reject(RejectReason::InsufficientFunds, 2),
            Err(RejectReason::StateInvalid)
        );
    }

    #[test]
    fn reject_active_transitions_accepted_order_to_rejected() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        o.reject_active(RejectReason::VenueUnreachable, 2).unwrap();
        assert_eq!(o.state, OrderStatus::Rejected);
        assert_eq!(o.reason.as_deref(), Some("venue_unreachable"));
    }

    #[test]
    fn reject_active_also_valid_from_partially_filled() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        o.apply_fill(dec!(0.3), dec!(50000), 2).unwrap();
        assert!(o.reject_active(RejectReason::VenueUnreachable, 3).is_ok());
        assert_eq!(o.state, OrderStatus::Rejected);
    }

    #[test]
    fn reject_active_is_invalid_from_new_or_terminal_states() {
        let mut o = new_order(dec!(1.0));
        assert_eq!(
            o.reject_active(RejectReason::VenueUnreachable, 1),
            Err(RejectReason::StateInvalid)
        );
        o.accept(1).unwrap();
        o.apply_fill(dec!(1.0), dec!(50000), 2).unwrap();
        assert_eq!(
            o.reject_active(RejectReason::VenueUnreachable, 3),
            Err(RejectReason::StateInvalid)
        );
    }

    #[test]
    fn zero_qty_and_zero_price_fills_are_rejected() {
        let mut o = new_order(dec!(1.0));
        o.accept(1).unwrap();
        assert!(o.apply_fill(Decimal::ZERO, dec!(50000), 2).is_err());
        assert!(o.apply_fill(dec!(0.1), Decimal::ZERO, 2).is_err());
    }
}
