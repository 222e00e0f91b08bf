//! Execution backends: a [`Fill Simulator`](simulated) for paper trading and
//! a [`Venue adapter`](venue) for live dispatch, interchangeable per order at
//! placement time and both speaking the same [`Executor`] trait.
//!
//! Both backends report outcomes asynchronously through an `on_event`
//! callback rather than a synchronous return value, because a fill may
//! arrive an arbitrary time after submission (simulated latency, or a real
//! venue round trip) — the callback is invoked from whichever thread
//! produced the outcome and is expected to re-enter the dispatcher via
//! `EventLoop::post`, never to mutate Engine State directly.

pub mod simulated;
pub mod venue;

pub use simulated::FillSimulator;
pub use venue::VenueAdapter;

use crate::core::ids::{ClientOrderId, VenueOrderId};
use crate::core::RejectReason;
use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Simulated,
    Live,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "SIMULATED"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Asynchronous outcome of a submitted order or cancellation. Fed back into
/// the dispatcher by whichever executor produced it; the dispatcher is
/// responsible for routing it through `core::order_fsm`.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// A venue has taken ownership of the order under `venue_order_id`.
    /// Purely informational bookkeeping — the order is already `ACCEPTED`
    /// in Engine State by the time an executor is invoked.
    Acknowledged {
        client_order_id: ClientOrderId,
        venue_order_id: VenueOrderId,
        ts_ns: i64,
    },
    Fill {
        client_order_id: ClientOrderId,
        venue_order_id: Option<VenueOrderId>,
        qty: Decimal,
        price: Decimal,
        ts_ns: i64,
        /// Receipt ordering key for out-of-order detection (spec §4.3): a
        /// fill is applied only if `sequence` ≥ the last one applied to
        /// this order.
        sequence: u64,
        /// Whether this fill added liquidity (GTC resting) rather than
        /// took it (IOC/FOK), for the maker/taker fee split.
        is_maker: bool,
    },
    Cancelled {
        client_order_id: ClientOrderId,
        ts_ns: i64,
    },
    Rejected {
        client_order_id: ClientOrderId,
        reason: RejectReason,
        ts_ns: i64,
    },
}

pub type EventSink = Arc<dyn Fn(ExecutorEvent) + Send + Sync>;

/// A minimal market-data view an executor needs to generate a fill: the
/// current mark price for a symbol. Engine State is the implementor.
pub trait MarkPriceSource: Send + Sync {
    fn mark_price(&self, symbol: &str) -> Option<Decimal>;
}

/// Backend that turns an accepted order into eventual fills or a rejection.
/// Order acceptance itself is an Engine State/Risk Engine decision made
/// before an executor ever sees the order; executors only produce the
/// asynchronous outcomes that follow acceptance.
pub trait Executor: Send + Sync {
    fn execution_mode(&self) -> ExecutionMode;

    /// Begin executing `client_order_id` for `qty` remaining on `symbol`,
    /// `side` at `limit_price` (None for MARKET). Outcomes are reported via
    /// `on_event`, possibly more than once (partial fills).
    fn submit_order(
        &self,
        client_order_id: ClientOrderId,
        symbol: &str,
        side: crate::core::types::Side,
        qty: Decimal,
        limit_price: Option<Decimal>,
        time_in_force: crate::core::types::TimeInForce,
        accepted_ns: i64,
        on_event: EventSink,
    ) -> Result<()>;

    /// Best-effort cancellation; outcome reported via `on_event` just like
    /// `submit_order`, since a venue cancel is itself asynchronous.
    fn cancel_order(&self, client_order_id: ClientOrderId, on_event: EventSink) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_mode_display_matches_wire_style() {
        assert_eq!(ExecutionMode::Simulated.to_string(), "SIMULATED");
        assert_eq!(ExecutionMode::Live.to_string(), "LIVE");
    }
}
