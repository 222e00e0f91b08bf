//! Core domain types and state machines: orders, ids, errors, and the
//! priority event loop that drives the engine.

pub mod command_bus;
pub mod errors;
pub mod event;
pub mod event_loop;
pub mod ids;
pub mod order_fsm;
pub mod types;

pub use errors::{ConversionError, OverflowError, PositionError, RejectReason};
pub use ids::{ClientOrderId, VenueOrderId};
pub use order_fsm::FillOutcome;
pub use types::{
    fixed_point, Balance, MarketEvent, Order, OrderFlags, OrderStatus, OrderType, Position,
    PositionSide, Side, TimeInForce,
};
