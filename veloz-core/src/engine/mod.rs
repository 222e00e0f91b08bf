//! Trading Engine: the dispatcher-thread orchestrator tying the Command
//! Bus, Risk Engine, Engine State, Executor, and Event Loop together.
//!
//! `Engine::dispatch_command` and `Engine::apply_executor_event` are only
//! ever safe to call from the single thread running `EventLoop::run` — all
//! other producers (stdio readers, market-data feeds, executor callbacks)
//! post a task instead of calling into `EngineState` directly, the same
//! single-writer discipline the event loop itself documents.

pub mod state;

pub use state::{CancelOutcome, EngineSnapshot, EngineState, MarkBook, PlaceOrderRequest, PlaceOutcome};

use crate::core::command_bus::{parse_command, Command, QueryTarget};
use crate::core::errors::RejectReason;
use crate::core::event_loop::{EventLoop, Priority};
use crate::core::types::{MarketEvent, Order, OrderType};
use crate::execution::{EventSink, Executor, ExecutorEvent};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::{Arc, Weak};

fn order_to_json(order: &Order) -> serde_json::Value {
    serde_json::json!({
        "client_order_id": order.client_order_id.as_str(),
        "venue_order_id": order.venue_order_id.as_ref().map(|v| v.as_str()),
        "symbol": order.symbol,
        "side": order.side,
        "order_type": order.order_type,
        "order_qty": order.order_qty,
        "limit_price": order.limit_price,
        "executed_qty": order.executed_qty,
        "avg_price": order.avg_price,
        "status": order.state.to_string(),
        "reason": order.reason,
    })
}

/// Owns the single `EngineState` behind a lock that is only ever taken from
/// the dispatcher thread, plus the executor that turns accepted orders into
/// fills. Cheap to clone a handle via `Arc<Engine<_>>` for cross-thread
/// producers.
pub struct Engine<W: Write + Send + 'static> {
    state: Mutex<EngineState<W>>,
    event_loop: Arc<EventLoop>,
    executor: Arc<dyn Executor>,
}

impl<W: Write + Send + 'static> Engine<W> {
    pub fn new(state: EngineState<W>, event_loop: Arc<EventLoop>, executor: Arc<dyn Executor>) -> Arc<Self> {
        let engine = Arc::new(Self {
            state: Mutex::new(state),
            event_loop: Arc::clone(&event_loop),
            executor,
        });

        // A `Weak` handle here, never a strong one: the event loop already
        // holds this closure for the engine's entire lifetime, and the
        // engine holds an `Arc<EventLoop>` right back — a strong capture
        // would keep both alive forever.
        let weak_engine: Weak<Self> = Arc::downgrade(&engine);
        event_loop.set_panic_storm_handler(move || {
            if let Some(engine) = weak_engine.upgrade() {
                engine.state.lock().trip_breaker_for_panic_storm();
            }
        });

        engine
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Parse and apply one command line, returning the JSON response the
    /// stdio host writes back to the client. Must run on the dispatcher
    /// thread.
    pub fn dispatch_command(self: &Arc<Self>, line: &str, now_ns: i64) -> serde_json::Value {
        match parse_command(line) {
            Err(reason) => serde_json::json!({"status": "REJECTED", "reason": reason.as_str()}),
            Ok(Command::Order {
                side,
                symbol,
                qty,
                price,
                client_order_id,
                order_type,
                time_in_force,
                flags,
            }) => {
                let limit_price = match order_type {
                    OrderType::Limit => Some(price),
                    OrderType::Market => None,
                };
                let req = PlaceOrderRequest {
                    client_order_id,
                    symbol,
                    side,
                    order_type,
                    qty,
                    limit_price,
                    time_in_force,
                    flags,
                };
                let outcome = self.state.lock().place_order(req, now_ns);
                match outcome {
                    Ok(PlaceOutcome::Accepted(order)) => {
                        self.spawn_execution(order.clone(), now_ns);
                        serde_json::json!({"status": "ACCEPTED", "client_order_id": order.client_order_id.as_str()})
                    }
                    Ok(PlaceOutcome::Rejected { client_order_id, reason }) => {
                        serde_json::json!({
                            "status": "REJECTED",
                            "client_order_id": client_order_id.as_str(),
                            "reason": reason.as_str(),
                        })
                    }
                    Ok(PlaceOutcome::Duplicate { client_order_id }) => {
                        serde_json::json!({
                            "status": "REJECTED",
                            "client_order_id": client_order_id.as_str(),
                            "reason": RejectReason::DuplicateClientOrderId.as_str(),
                        })
                    }
                    Err(e) => serde_json::json!({"status": "ERROR", "message": e.to_string()}),
                }
            }
            Ok(Command::Cancel { client_order_id }) => {
                let outcome = self.state.lock().cancel_order(&client_order_id, now_ns);
                match outcome {
                    Ok(CancelOutcome::Cancelled(order)) => {
                        serde_json::json!({"status": "CANCELLED", "client_order_id": order.client_order_id.as_str()})
                    }
                    Ok(CancelOutcome::NotFound) => {
                        serde_json::json!({"status": "REJECTED", "reason": RejectReason::NotFound.as_str()})
                    }
                    Ok(CancelOutcome::NoopTerminal) => serde_json::json!({"status": "NOOP"}),
                    Err(e) => serde_json::json!({"status": "ERROR", "message": e.to_string()}),
                }
            }
            Ok(Command::Query(target)) => self.dispatch_query(target),
        }
    }

    fn dispatch_query(&self, target: QueryTarget) -> serde_json::Value {
        let state = self.state.lock();
        match target {
            QueryTarget::Order(id) => state
                .order(&id)
                .map(order_to_json)
                .unwrap_or_else(|| serde_json::json!({"status": "REJECTED", "reason": RejectReason::NotFound.as_str()})),
            QueryTarget::Orders => {
                serde_json::json!({ "orders": state.orders().map(order_to_json).collect::<Vec<_>>() })
            }
            QueryTarget::Account => {
                let balances: Vec<_> = state
                    .balances()
                    .iter()
                    .map(|(asset, b)| serde_json::json!({"asset": asset, "free": b.free, "locked": b.locked}))
                    .collect();
                serde_json::json!({ "balances": balances })
            }
            QueryTarget::Position(symbol) => match state.position(&symbol) {
                Some(p) => serde_json::json!({
                    "symbol": symbol,
                    "qty": p.qty,
                    "avg_entry_price": p.avg_entry_price,
                    "realized_pnl": p.realized_pnl,
                }),
                None => serde_json::json!({"symbol": symbol, "qty": "0"}),
            },
            QueryTarget::Positions => {
                let positions: Vec<_> = state
                    .positions()
                    .iter()
                    .map(|(symbol, p)| {
                        serde_json::json!({
                            "symbol": symbol,
                            "qty": p.qty,
                            "avg_entry_price": p.avg_entry_price,
                            "realized_pnl": p.realized_pnl,
                        })
                    })
                    .collect();
                serde_json::json!({ "positions": positions })
            }
        }
    }

    /// Updates the mark-price book from an inbound market data event. Must
    /// run on the dispatcher thread, same as commands.
    pub fn on_market_event(&self, event: &MarketEvent) {
        if let Some(mark) = event.mark() {
            self.state.lock().update_mark(event.symbol(), mark);
        }
    }

    pub fn checkpoint(&self, now_ns: i64) -> anyhow::Result<u64> {
        self.state.lock().checkpoint(now_ns)
    }

    fn spawn_execution(self: &Arc<Self>, order: Order, accepted_ns: i64) {
        let engine = Arc::clone(self);
        let sink: EventSink = Arc::new(move |event| {
            let engine = Arc::clone(&engine);
            engine.event_loop.post(
                Box::new(move || {
                    let ts_ns = executor_event_ts(&event);
                    if let Err(e) = engine.state.lock().apply_executor_event(event, ts_ns) {
                        tracing::error!(error = %e, "failed to apply executor event");
                    }
                }),
                Priority::High,
                vec!["executor-event".to_string()],
            );
        });

        if let Err(e) = self.executor.submit_order(
            order.client_order_id.clone(),
            &order.symbol,
            order.side,
            order.remaining_qty(),
            order.limit_price,
            order.time_in_force,
            accepted_ns,
            sink,
        ) {
            tracing::error!(error = %e, "executor submit_order failed");
        }
    }
}

fn executor_event_ts(event: &ExecutorEvent) -> i64 {
    match event {
        ExecutorEvent::Acknowledged { ts_ns, .. }
        | ExecutorEvent::Fill { ts_ns, .. }
        | ExecutorEvent::Cancelled { ts_ns, .. }
        | ExecutorEvent::Rejected { ts_ns, .. } => *ts_ns,
    }
}
