//! Fill Simulator: paper-trading backend.
//!
//! Replaces the teacher's instant pessimistic-fill `SimulatedExecutor` with
//! a delayed one. Submission posts a task onto the shared [`EventLoop`] due
//! at `accepted_ns + latency_ms`; when that task fires it produces a fill
//! for the full remaining quantity at a price perturbed by `slippage_bps`
//! around the current mark. Splitting into several partial fills is
//! supported (`partial_fill_count`) for scenarios that need it, applied in
//! a fixed, deterministic order rather than randomly.

use super::{EventSink, ExecutionMode, Executor, ExecutorEvent, MarkPriceSource};
use crate::core::event_loop::{EventLoop, Priority};
use crate::core::ids::ClientOrderId;
use crate::core::types::{Side, TimeInForce};
use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct SimulationParams {
    pub latency_ms: u64,
    pub slippage_bps: u32,
    /// Number of equal-sized partial fills to split each order into.
    /// `1` (the default) means a single fill for the full quantity.
    pub partial_fill_count: u32,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            latency_ms: 5,
            slippage_bps: 2,
            partial_fill_count: 1,
        }
    }
}

pub struct FillSimulator {
    event_loop: Arc<EventLoop>,
    marks: Arc<dyn MarkPriceSource>,
    params: SimulationParams,
}

impl FillSimulator {
    pub fn new(event_loop: Arc<EventLoop>, marks: Arc<dyn MarkPriceSource>, params: SimulationParams) -> Self {
        Self {
            event_loop,
            marks,
            params,
        }
    }
}

fn slipped_price(mark: Decimal, side: Side, slippage_bps: u32) -> Decimal {
    let bps = Decimal::new(slippage_bps as i64, 4); // e.g. 2bps = 0.0002
    match side {
        Side::Buy => mark * (Decimal::ONE + bps),
        Side::Sell => mark * (Decimal::ONE - bps),
    }
}

impl Executor for FillSimulator {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Simulated
    }

    fn submit_order(
        &self,
        client_order_id: ClientOrderId,
        symbol: &str,
        side: Side,
        qty: Decimal,
        _limit_price: Option<Decimal>,
        time_in_force: TimeInForce,
        accepted_ns: i64,
        on_event: EventSink,
    ) -> Result<()> {
        let params = self.params;
        let splits = params.partial_fill_count.max(1);
        let slice_qty = qty / Decimal::from(splits);
        // IOC/FOK take resting liquidity immediately; GTC orders that reach
        // the simulator are treated as resting (maker) fills.
        let is_maker = time_in_force == TimeInForce::Gtc;

        for i in 0..splits {
            let is_last = i + 1 == splits;
            let client_order_id = client_order_id.clone();
            let symbol = symbol.to_string();
            let marks = Arc::clone(&self.marks);
            let on_event = Arc::clone(&on_event);

            let remaining_for_slice = if is_last {
                qty - slice_qty * Decimal::from(splits - 1)
            } else {
                slice_qty
            };

            let delay = Duration::from_millis(params.latency_ms * (i as u64 + 1));
            self.event_loop.post_delayed(
                Box::new(move || {
                    let Some(mark) = marks.mark_price(&symbol) else {
                        on_event(ExecutorEvent::Rejected {
                            client_order_id,
                            reason: crate::core::RejectReason::VenueUnreachable,
                            ts_ns: accepted_ns,
                        });
                        return;
                    };
                    let price = slipped_price(mark, side, params.slippage_bps);
                    on_event(ExecutorEvent::Fill {
                        client_order_id,
                        venue_order_id: None,
                        qty: remaining_for_slice,
                        price,
                        ts_ns: accepted_ns,
                        sequence: i as u64 + 1,
                        is_maker,
                    });
                }),
                delay,
                Priority::Normal,
                vec!["fill-simulator".to_string()],
            );
        }

        Ok(())
    }

    fn cancel_order(&self, client_order_id: ClientOrderId, on_event: EventSink) -> Result<()> {
        // Simulated cancels are immediate: there is no venue round trip to
        // wait on.
        self.event_loop.post(
            Box::new(move || {
                on_event(ExecutorEvent::Cancelled {
                    client_order_id,
                    ts_ns: 0,
                });
            }),
            Priority::High,
            vec!["fill-simulator-cancel".to_string()],
        );
        Ok(())
    }
}
