//! VeloZ Core - deterministic single-writer crypto trading engine.
//!
//! A command comes in over the Command Bus, the Risk Engine gates it,
//! Engine State is the single source of truth for balances/orders/positions
//! and owns the WAL write point, and an Executor (simulated fill engine or
//! live venue adapter) turns an accepted order into eventual fills — all
//! serialized onto one dispatcher thread driven by the priority Event Loop.
//!
//! ## Core Modules
//! - `core`: order/id/event types, the order state machine, the command
//!   grammar, and the priority event loop that drives the whole engine
//! - `config`: the single TOML-loaded runtime configuration
//! - `engine`: Engine State (balances/orders/positions/WAL) and the
//!   `Engine` orchestrator that wires it to the event loop and an executor
//! - `execution`: the paper-trading Fill Simulator and the live Venue
//!   adapter, both behind the same `Executor` trait
//! - `risk`: pre-trade checks and the post-trade circuit breaker
//! - `wal`: the append-only write-ahead log and its replication sender
//! - `resilience`: backoff and panic-handling shared by venue I/O
//! - `utils`: tracing/logging setup
//! - `runtime`: assembles a `Config` into a running `Engine`

pub mod config;
pub mod core;
pub mod engine;
pub mod execution;
pub mod resilience;
pub mod risk;
pub mod runtime;
pub mod utils;
pub mod wal;

pub use config::Config;
pub use engine::{Engine, EngineState};
pub use runtime::Runtime;

pub use anyhow::{Error, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::core::{
        Balance, ClientOrderId, MarketEvent, Order, OrderFlags, OrderStatus, OrderType, Position,
        PositionSide, RejectReason, Side, TimeInForce, VenueOrderId,
    };
    pub use crate::engine::{CancelOutcome, Engine, EngineState, PlaceOrderRequest, PlaceOutcome};
    pub use crate::execution::{ExecutionMode, Executor, ExecutorEvent};
    pub use crate::risk::RiskEngine;
    pub use crate::runtime::Runtime;

    pub use crate::{Error, Result};
}
