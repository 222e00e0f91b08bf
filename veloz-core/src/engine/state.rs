//! Engine State: the single source of truth for balances, orders, and
//! positions, and the owner of the WAL write point (spec §4.3).
//!
//! All mutation goes through the methods here, under whatever lock the
//! caller holds — in practice a single `Mutex<EngineState<_>>` accessed only
//! from the Event Loop's dispatcher thread, so the lock is uncontended on
//! the hot path and exists mainly to let producer threads (command I/O,
//! executor callbacks) hand off safely.

use crate::config::RiskConfig;
use crate::core::errors::RejectReason;
use crate::core::ids::{ClientOrderId, VenueOrderId};
use crate::core::types::{Balance, Order, OrderFlags, OrderStatus, OrderType, Position, Side, TimeInForce};
use crate::core::event::{EventEmitter, EventKind};
use crate::execution::venue::ReconciliationDivergence;
use crate::execution::{ExecutorEvent, MarkPriceSource};
use crate::risk::{BasisPointsFeePolicy, CircuitBreakerConfig, FeePolicy, OrderRiskContext, RiskEngine};
use crate::wal::replication::ReplicationSender;
use crate::wal::{Wal, WalEntryType};
use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Shared last-observed mark price per symbol, fed by `MarketEvent`
/// ingestion and consumed both by the Risk Engine's price-protection check
/// and by the Fill Simulator.
#[derive(Default)]
pub struct MarkBook {
    marks: Mutex<HashMap<String, Decimal>>,
}

impl MarkBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, mark: Decimal) {
        self.marks.lock().insert(symbol.to_string(), mark);
    }

    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.marks.lock().get(symbol).copied()
    }
}

impl MarkPriceSource for MarkBook {
    fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.get(symbol)
    }
}

/// Splits a symbol like `BTCUSDT` into `(base, quote)`. Not part of the
/// external interface contract; a pragmatic convention needed to route
/// reservations/credits to the right asset, documented as an open-question
/// resolution in the design ledger.
fn split_symbol(symbol: &str) -> (String, String) {
    const QUOTES: &[&str] = &["USDT", "BUSD", "USDC", "TUSD", "USD", "BTC", "ETH", "BNB"];
    for quote in QUOTES {
        if symbol.len() > quote.len() && symbol.ends_with(quote) {
            let base = &symbol[..symbol.len() - quote.len()];
            return (base.to_string(), quote.to_string());
        }
    }
    let split_at = symbol.len().saturating_sub(3).max(1);
    (symbol[..split_at].to_string(), symbol[split_at..].to_string())
}

fn sign(d: Decimal) -> i8 {
    if d > Decimal::ZERO {
        1
    } else if d < Decimal::ZERO {
        -1
    } else {
        0
    }
}

/// Updates a position in place for a fill of `q` at `p` on the given side.
/// Side flips close the prior leg (realizing PnL on it) and open a fresh
/// leg at the fill price, per spec §3.
fn apply_fill_to_position(position: &mut Position, side: Side, q: Decimal, p: Decimal) {
    let signed_delta = match side {
        Side::Buy => q,
        Side::Sell => -q,
    };
    let prev_qty = position.qty;

    if prev_qty == Decimal::ZERO {
        position.qty = signed_delta;
        position.avg_entry_price = p;
        return;
    }

    let same_direction = sign(prev_qty) == sign(signed_delta);

    if same_direction {
        let new_qty = prev_qty + signed_delta;
        position.avg_entry_price =
            (position.avg_entry_price * prev_qty.abs() + p * signed_delta.abs()) / new_qty.abs();
        position.qty = new_qty;
        return;
    }

    let closing_qty = signed_delta.abs().min(prev_qty.abs());
    let pnl = if prev_qty > Decimal::ZERO {
        closing_qty * (p - position.avg_entry_price)
    } else {
        closing_qty * (position.avg_entry_price - p)
    };
    position.realized_pnl += pnl;

    let new_qty = prev_qty + signed_delta;
    if new_qty == Decimal::ZERO {
        position.qty = Decimal::ZERO;
        position.avg_entry_price = Decimal::ZERO;
    } else if sign(new_qty) == sign(prev_qty) {
        position.qty = new_qty;
    } else {
        position.qty = new_qty;
        position.avg_entry_price = p;
    }
}

pub struct PlaceOrderRequest {
    pub client_order_id: Option<ClientOrderId>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub flags: OrderFlags,
}

#[derive(Debug)]
pub enum PlaceOutcome {
    Accepted(Order),
    Rejected { client_order_id: ClientOrderId, reason: RejectReason },
    Duplicate { client_order_id: ClientOrderId },
}

#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled(Order),
    NotFound,
    NoopTerminal,
}

#[derive(Serialize, Deserialize)]
struct WalOrderAccepted {
    client_order_id: String,
    symbol: String,
    side: Side,
    order_type: OrderType,
    order_qty: Decimal,
    limit_price: Option<Decimal>,
    time_in_force: TimeInForce,
    flags: OrderFlags,
    paying_asset: String,
    reservation: Decimal,
}

#[derive(Serialize, Deserialize)]
struct WalOrderRejected {
    client_order_id: String,
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct WalOrderCanceled {
    client_order_id: String,
}

#[derive(Serialize, Deserialize)]
struct WalFill {
    client_order_id: String,
    symbol: String,
    qty: Decimal,
    price: Decimal,
}

#[derive(Serialize, Deserialize)]
struct WalBalanceUpdate {
    asset: String,
    free: Decimal,
    locked: Decimal,
}

/// A full serialization of Engine State, written as a `Checkpoint` WAL
/// entry and used both for log compaction and for fast startup recovery.
#[derive(Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub account: String,
    pub balances: HashMap<String, Balance>,
    pub orders: Vec<Order>,
    pub positions: HashMap<String, Position>,
    pub reservations: HashMap<String, (String, Decimal)>,
    pub last_applied_sequence: HashMap<String, u64>,
}

pub struct EngineState<W: Write + Send> {
    account: String,
    balances: HashMap<String, Balance>,
    orders: HashMap<ClientOrderId, Order>,
    positions: HashMap<String, Position>,
    /// Asset and remaining amount reserved for each live order, tracked
    /// explicitly rather than recomputed from `remaining_qty` so that a
    /// cancel releases exactly what is still locked even when a fill price
    /// differs from the order's limit price or a MARKET order's worst-case
    /// price at placement.
    reservations: HashMap<ClientOrderId, (String, Decimal)>,
    last_applied_sequence: HashMap<ClientOrderId, u64>,
    marks: Arc<MarkBook>,
    risk: RiskEngine,
    fees: Box<dyn FeePolicy>,
    wal: Wal,
    replication: ReplicationSender,
    emitter: EventEmitter<W>,
    out_of_order_discarded: u64,
}

impl<W: Write + Send> EngineState<W> {
    pub fn new(
        account: impl Into<String>,
        risk_config: RiskConfig,
        breaker_config: CircuitBreakerConfig,
        marks: Arc<MarkBook>,
        wal: Wal,
        replication: ReplicationSender,
        emitter: EventEmitter<W>,
    ) -> Self {
        let fees = Box::new(BasisPointsFeePolicy {
            maker_bps: risk_config.maker_fee_bps,
            taker_bps: risk_config.taker_fee_bps,
        });
        Self {
            account: account.into(),
            balances: HashMap::new(),
            orders: HashMap::new(),
            positions: HashMap::new(),
            reservations: HashMap::new(),
            last_applied_sequence: HashMap::new(),
            marks,
            risk: RiskEngine::new(risk_config, breaker_config),
            fees,
            wal,
            replication,
            emitter,
            out_of_order_discarded: 0,
        }
    }

    pub fn deposit(&mut self, asset: impl Into<String>, amount: Decimal) {
        self.balances.entry(asset.into()).or_default().free += amount;
    }

    pub fn balance(&self, asset: &str) -> Balance {
        self.balances.get(asset).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> &HashMap<String, Balance> {
        &self.balances
    }

    pub fn order(&self, client_order_id: &str) -> Option<&Order> {
        self.orders.values().find(|o| o.client_order_id.as_str() == client_order_id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn update_mark(&self, symbol: &str, mark: Decimal) {
        self.marks.update(symbol, mark);
    }

    pub fn marks(&self) -> &Arc<MarkBook> {
        &self.marks
    }

    /// Outstanding `Accepted`/`PartiallyFilled` orders, as needed by venue
    /// reconciliation (spec §4.6): client order id, the venue id once known,
    /// and the quantity still unfilled.
    pub fn outstanding_orders_for_reconciliation(&self) -> Vec<(ClientOrderId, Option<VenueOrderId>, Decimal)> {
        self.orders
            .values()
            .filter(|o| matches!(o.state, OrderStatus::Accepted | OrderStatus::PartiallyFilled))
            .map(|o| (o.client_order_id.clone(), o.venue_order_id.clone(), o.remaining_qty()))
            .collect()
    }

    /// Reports reconciliation divergences as a health signal. Never mutates
    /// order/balance/position state — a divergence is resolved by whatever
    /// normal lifecycle event (fill, cancel, rejection) catches Engine State
    /// up with the venue, not by this method.
    pub fn report_reconciliation_divergences(
        &mut self,
        divergences: &[ReconciliationDivergence],
        now_ns: i64,
    ) -> Result<()> {
        if divergences.is_empty() {
            return Ok(());
        }
        tracing::warn!(count = divergences.len(), "venue reconciliation found divergences");
        self.emitter.emit(
            EventKind::Error,
            now_ns,
            &serde_json::json!({
                "kind": "reconciliation_divergence",
                "divergences": divergences,
            }),
        )?;
        Ok(())
    }

    fn account_equity(&self, quote_asset: &str) -> Decimal {
        let mut equity = self.balances.get(quote_asset).map(|b| b.total()).unwrap_or_default();
        for (symbol, position) in &self.positions {
            if let Some(mark) = self.marks.get(symbol) {
                equity += position.unrealized_pnl(mark);
            }
        }
        equity
    }

    fn total_notional(&self, excluding_symbol: &str, extra_position_after_qty: Decimal, mark_for_symbol: Decimal) -> Decimal {
        let mut total = extra_position_after_qty.abs() * mark_for_symbol;
        for (symbol, position) in &self.positions {
            if symbol == excluding_symbol {
                continue;
            }
            if let Some(mark) = self.marks.get(symbol) {
                total += position.qty.abs() * mark;
            }
        }
        total
    }

    /// Appends `payload` to the WAL and forwards it to the replication
    /// sender. Per spec §7, durability is all-or-nothing for the caller: on
    /// any failure here the breaker is driven straight to `OPEN` (a hard
    /// stop, not a counted failure) and the error is returned so the caller
    /// aborts its in-memory mutation rather than committing state the WAL
    /// never durably recorded.
    fn append_wal(&mut self, entry_type: WalEntryType, ts_ns: i64, payload: &impl Serialize) -> Result<u64> {
        let result = (|| -> Result<u64> {
            let bytes = serde_json::to_vec(payload)?;
            let sequence = self.wal.append(entry_type, ts_ns, &bytes)?;
            self.replication
                .send(sequence, bytes)
                .map_err(|reason| anyhow::anyhow!("{reason}"))?;
            Ok(sequence)
        })();

        if let Err(e) = &result {
            self.risk.force_open_breaker();
            tracing::error!(
                error = %e,
                reason = %RejectReason::WalDurabilityFailed,
                "WAL append failed; breaker forced OPEN"
            );
        }
        result
    }

    /// Order placement procedure (spec §4.3, steps 1-4; step 5 — scheduling
    /// execution — is the caller's responsibility once this returns
    /// `Accepted`, since Engine State does not own an `Executor`).
    pub fn place_order(&mut self, req: PlaceOrderRequest, now_ns: i64) -> Result<PlaceOutcome> {
        let client_order_id = req.client_order_id.unwrap_or_else(ClientOrderId::new_random);

        if self.orders.contains_key(&client_order_id) {
            self.emitter.emit(
                EventKind::OrderUpdate,
                now_ns,
                &serde_json::json!({
                    "client_order_id": client_order_id.as_str(),
                    "status": "REJECTED",
                    "reason": RejectReason::DuplicateClientOrderId.as_str(),
                }),
            )?;
            return Ok(PlaceOutcome::Duplicate { client_order_id });
        }

        let (base_asset, quote_asset) = split_symbol(&req.symbol);
        let mark = self.marks.get(&req.symbol).or(req.limit_price).unwrap_or_default();

        let (paying_asset, required_reservation) = match (req.order_type, req.side) {
            (OrderType::Limit, Side::Buy) => {
                (quote_asset.clone(), req.qty * req.limit_price.unwrap_or_default())
            }
            (OrderType::Limit, Side::Sell) => (base_asset.clone(), req.qty),
            (OrderType::Market, Side::Buy) => {
                let worst_price = mark * (Decimal::ONE + self.risk.max_price_deviation());
                (quote_asset.clone(), req.qty * worst_price)
            }
            (OrderType::Market, Side::Sell) => (base_asset.clone(), req.qty),
        };

        let available_free = self.balances.get(&paying_asset).map(|b| b.free).unwrap_or_default();
        let prev_position_qty = self.positions.get(&req.symbol).map(|p| p.qty).unwrap_or_default();
        let signed_qty = match req.side {
            Side::Buy => req.qty,
            Side::Sell => -req.qty,
        };
        let position_after_qty = prev_position_qty + signed_qty;
        let total_notional_after = self.total_notional(&req.symbol, position_after_qty, mark);
        let equity = self.account_equity(&quote_asset);

        let ctx = OrderRiskContext {
            symbol: &req.symbol,
            account: &self.account,
            order_type: req.order_type,
            qty: req.qty,
            limit_price: req.limit_price,
            mark,
            required_reservation,
            available_free,
            position_after_qty,
            total_notional_after,
            equity,
        };

        let now = now_ns;
        let created_ns = now;
        let mut order = Order {
            client_order_id: client_order_id.clone(),
            venue_order_id: None,
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            order_qty: req.qty,
            limit_price: req.limit_price,
            time_in_force: req.time_in_force,
            flags: req.flags,
            executed_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            state: OrderStatus::New,
            reason: None,
            created_ns,
            last_update_ns: created_ns,
        };

        match self.risk.check_order(&ctx) {
            Err(reason) => {
                order.reject(reason, now)?;
                if reason.counts_toward_breaker() {
                    self.risk.record_rejection(&req.symbol);
                }
                self.append_wal(
                    WalEntryType::OrderRejected,
                    now,
                    &WalOrderRejected {
                        client_order_id: client_order_id.as_str().to_string(),
                        reason: reason.as_str().to_string(),
                    },
                )?;
                self.emitter.emit(
                    EventKind::OrderUpdate,
                    now,
                    &serde_json::json!({
                        "client_order_id": client_order_id.as_str(),
                        "status": "REJECTED",
                        "reason": reason.as_str(),
                        "symbol": order.symbol,
                    }),
                )?;
                self.orders.insert(client_order_id.clone(), order);
                Ok(PlaceOutcome::Rejected { client_order_id, reason })
            }
            Ok(()) => {
                order.accept(now)?;

                // Durably record acceptance before committing the
                // reservation to `self` — if the WAL append fails, the
                // order must not end up with funds locked that were never
                // durably recorded as reserved.
                self.append_wal(
                    WalEntryType::OrderAccepted,
                    now,
                    &WalOrderAccepted {
                        client_order_id: client_order_id.as_str().to_string(),
                        symbol: order.symbol.clone(),
                        side: order.side,
                        order_type: order.order_type,
                        order_qty: order.order_qty,
                        limit_price: order.limit_price,
                        time_in_force: order.time_in_force,
                        flags: order.flags,
                        paying_asset: paying_asset.clone(),
                        reservation: required_reservation,
                    },
                )?;

                self.risk.record_acceptance(&req.symbol);
                {
                    let balance = self.balances.entry(paying_asset.clone()).or_default();
                    balance.free -= required_reservation;
                    balance.locked += required_reservation;
                }
                self.reservations
                    .insert(client_order_id.clone(), (paying_asset.clone(), required_reservation));

                self.emitter.emit(
                    EventKind::OrderUpdate,
                    now,
                    &serde_json::json!({
                        "client_order_id": client_order_id.as_str(),
                        "status": "ACCEPTED",
                        "symbol": order.symbol,
                        "side": order.side,
                        "qty": order.order_qty,
                        "price": order.limit_price,
                    }),
                )?;
                self.emit_account(now)?;

                self.orders.insert(client_order_id.clone(), order.clone());
                Ok(PlaceOutcome::Accepted(order))
            }
        }
    }

    pub fn cancel_order(&mut self, client_order_id: &str, now_ns: i64) -> Result<CancelOutcome> {
        let Some(order) = self.orders.values().find(|o| o.client_order_id.as_str() == client_order_id).cloned() else {
            return Ok(CancelOutcome::NotFound);
        };

        if order.state.is_terminal() {
            return Ok(CancelOutcome::NoopTerminal);
        }

        let mut order = order;
        order.cancel(now_ns)?;

        self.append_wal(
            WalEntryType::OrderCanceled,
            now_ns,
            &WalOrderCanceled {
                client_order_id: order.client_order_id.as_str().to_string(),
            },
        )?;

        if let Some((asset, released)) = self.reservations.remove(&order.client_order_id) {
            let balance = self.balances.entry(asset).or_default();
            balance.locked -= released;
            balance.free += released;
        }

        self.emitter.emit(
            EventKind::OrderUpdate,
            now_ns,
            &serde_json::json!({
                "client_order_id": order.client_order_id.as_str(),
                "status": "CANCELLED",
            }),
        )?;
        self.emit_account(now_ns)?;

        self.orders.insert(order.client_order_id.clone(), order.clone());
        Ok(CancelOutcome::Cancelled(order))
    }

    /// Applies an asynchronous executor outcome. Out-of-order `Fill`
    /// receipts (sequence < last applied for this order) are discarded
    /// silently (counted), per spec §4.3.
    pub fn apply_executor_event(&mut self, event: ExecutorEvent, now_ns: i64) -> Result<()> {
        match event {
            ExecutorEvent::Acknowledged {
                client_order_id,
                venue_order_id,
                ..
            } => {
                if let Some(order) = self.orders.get_mut(&client_order_id) {
                    order.venue_order_id = Some(venue_order_id);
                }
                Ok(())
            }
            ExecutorEvent::Fill {
                client_order_id,
                qty,
                price,
                sequence,
                is_maker,
                ..
            } => self.apply_fill(&client_order_id, qty, price, sequence, is_maker, now_ns),
            ExecutorEvent::Cancelled { client_order_id, .. } => {
                self.cancel_order(client_order_id.as_str(), now_ns).map(|_| ())
            }
            ExecutorEvent::Rejected {
                client_order_id,
                reason,
                ..
            } => self.reject_accepted_order(&client_order_id, reason, now_ns),
        }
    }

    /// Spec §4.5: once an executor exhausts retries without a venue ack,
    /// the order transitions `{Accepted, PartiallyFilled} -> Rejected`, its
    /// balance reservation is released, and the rejection is durably
    /// recorded and announced like any other order-state change. A no-op
    /// for an order that is missing or already terminal.
    fn reject_accepted_order(
        &mut self,
        client_order_id: &ClientOrderId,
        reason: RejectReason,
        now_ns: i64,
    ) -> Result<()> {
        let Some(mut order) = self.orders.get(client_order_id).cloned() else {
            return Ok(());
        };
        if order.reject_active(reason, now_ns).is_err() {
            return Ok(());
        }
        tracing::warn!(client_order_id = %client_order_id, %reason, "executor exhausted retries; rejecting active order");

        self.append_wal(
            WalEntryType::OrderRejected,
            now_ns,
            &WalOrderRejected {
                client_order_id: client_order_id.as_str().to_string(),
                reason: reason.as_str().to_string(),
            },
        )?;

        if let Some((asset, released)) = self.reservations.remove(client_order_id) {
            let balance = self.balances.entry(asset).or_default();
            balance.locked -= released;
            balance.free += released;
        }
        if reason.counts_toward_breaker() {
            self.risk.record_rejection(&order.symbol);
        }

        self.emitter.emit(
            EventKind::OrderUpdate,
            now_ns,
            &serde_json::json!({
                "client_order_id": client_order_id.as_str(),
                "status": "REJECTED",
                "reason": reason.as_str(),
            }),
        )?;
        self.emit_account(now_ns)?;

        self.orders.insert(client_order_id.clone(), order);
        Ok(())
    }

    fn apply_fill(
        &mut self,
        client_order_id: &ClientOrderId,
        qty: Decimal,
        price: Decimal,
        sequence: u64,
        is_maker: bool,
        now_ns: i64,
    ) -> Result<()> {
        let last_applied = self.last_applied_sequence.get(client_order_id).copied().unwrap_or(0);
        if sequence > 0 && sequence < last_applied {
            self.out_of_order_discarded += 1;
            return Ok(());
        }

        let Some(order_before) = self.orders.get(client_order_id).cloned() else {
            return Ok(());
        };

        // Compute the fill's effect on a scratch copy of the order, the
        // balances it touches, and the position, without mutating `self` —
        // the WAL append below must succeed before any of this is committed.
        let mut order = order_before;
        let outcome = order.apply_fill(qty, price, now_ns)?;

        let (base_asset, quote_asset) = split_symbol(&order.symbol);
        let mut base_balance = self.balances.get(&base_asset).copied().unwrap_or_default();
        let mut quote_balance = self.balances.get(&quote_asset).copied().unwrap_or_default();
        let consumed_reservation = match order.side {
            Side::Buy => {
                let consume = qty * price;
                quote_balance.locked -= consume;
                base_balance.free += qty;
                consume
            }
            Side::Sell => {
                let credit = qty * price;
                base_balance.locked -= qty;
                quote_balance.free += credit;
                qty
            }
        };

        let fee = self.fees.fee(qty * price, is_maker);
        quote_balance.free -= fee;

        let mut position = self.positions.get(&order.symbol).copied().unwrap_or_else(Position::flat);
        apply_fill_to_position(&mut position, order.side, qty, price);
        position.realized_pnl -= fee;

        self.append_wal(
            WalEntryType::Fill,
            now_ns,
            &WalFill {
                client_order_id: client_order_id.as_str().to_string(),
                symbol: order.symbol.clone(),
                qty,
                price,
            },
        )?;

        self.last_applied_sequence.insert(client_order_id.clone(), sequence.max(last_applied));
        self.balances.insert(base_asset, base_balance);
        self.balances.insert(quote_asset, quote_balance);
        if order.state.is_terminal() {
            self.reservations.remove(client_order_id);
        } else if let Some((_, remaining)) = self.reservations.get_mut(client_order_id) {
            *remaining = (*remaining - consumed_reservation).max(Decimal::ZERO);
        }
        self.positions.insert(order.symbol.clone(), position);

        self.emitter.emit(
            EventKind::Fill,
            now_ns,
            &serde_json::json!({
                "client_order_id": client_order_id.as_str(),
                "symbol": order.symbol,
                "qty": qty,
                "price": price,
            }),
        )?;
        self.emitter.emit(
            EventKind::OrderUpdate,
            now_ns,
            &serde_json::json!({
                "client_order_id": client_order_id.as_str(),
                "status": order.state.to_string(),
            }),
        )?;
        self.emit_account(now_ns)?;

        self.orders.insert(client_order_id.clone(), order);
        let _ = outcome;
        Ok(())
    }

    fn emit_account(&mut self, now_ns: i64) -> Result<()> {
        for (asset, balance) in self.balances.clone() {
            self.append_wal(
                WalEntryType::BalanceUpdate,
                now_ns,
                &WalBalanceUpdate {
                    asset: asset.clone(),
                    free: balance.free,
                    locked: balance.locked,
                },
            )?;
        }
        let balances: Vec<_> = self
            .balances
            .iter()
            .map(|(asset, b)| serde_json::json!({"asset": asset, "free": b.free, "locked": b.locked}))
            .collect();
        self.emitter.emit(EventKind::Account, now_ns, &serde_json::json!({ "balances": balances }))?;
        Ok(())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            account: self.account.clone(),
            balances: self.balances.clone(),
            orders: self.orders.values().cloned().collect(),
            positions: self.positions.clone(),
            reservations: self
                .reservations
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect(),
            last_applied_sequence: self
                .last_applied_sequence
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
        }
    }

    pub fn checkpoint(&mut self, now_ns: i64) -> Result<u64> {
        let snapshot = self.snapshot();
        self.append_wal(WalEntryType::Checkpoint, now_ns, &snapshot)
    }

    /// Restore balances/orders/positions from a checkpoint snapshot, used
    /// at startup recovery before replaying forward WAL entries.
    pub fn restore_snapshot(&mut self, snapshot: EngineSnapshot) {
        self.balances = snapshot.balances;
        self.positions = snapshot.positions;
        self.orders = snapshot
            .orders
            .into_iter()
            .map(|o| (o.client_order_id.clone(), o))
            .collect();
        self.reservations = snapshot
            .reservations
            .into_iter()
            .filter_map(|(k, v)| ClientOrderId::new(k).ok().map(|id| (id, v)))
            .collect();
        self.last_applied_sequence = snapshot
            .last_applied_sequence
            .into_iter()
            .filter_map(|(k, v)| ClientOrderId::new(k).ok().map(|id| (id, v)))
            .collect();
    }

    pub fn out_of_order_discarded(&self) -> u64 {
        self.out_of_order_discarded
    }

    /// Hard-stop safety trip for the event loop's panic-storm detector
    /// (spec §7): forces the breaker OPEN directly, bypassing its normal
    /// failure-threshold count.
    pub fn trip_breaker_for_panic_storm(&mut self) {
        tracing::error!("panic storm detected (3 panics/1s); breaker forced OPEN");
        self.risk.force_open_breaker();
    }

    /// Rebuilds balances/orders/positions from an on-disk WAL: the most
    /// recent `Checkpoint` snapshot (if any), then every entry appended
    /// after it, applied in sequence order. Facts are replayed directly
    /// into the in-memory maps without re-appending to the WAL or
    /// re-emitting events — they are already durably recorded.
    pub fn restore_from_wal(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        use crate::wal::WalEntry;

        Wal::replay(path, |entry: WalEntry| {
            match entry.entry_type {
                WalEntryType::Checkpoint => {
                    let snapshot: EngineSnapshot = serde_json::from_slice(&entry.payload)?;
                    self.restore_snapshot(snapshot);
                }
                WalEntryType::OrderAccepted => {
                    let rec: WalOrderAccepted = serde_json::from_slice(&entry.payload)?;
                    let client_order_id = ClientOrderId::new(rec.client_order_id)?;
                    let mut order = Order {
                        client_order_id: client_order_id.clone(),
                        venue_order_id: None,
                        symbol: rec.symbol,
                        side: rec.side,
                        order_type: rec.order_type,
                        order_qty: rec.order_qty,
                        limit_price: rec.limit_price,
                        time_in_force: rec.time_in_force,
                        flags: rec.flags,
                        executed_qty: Decimal::ZERO,
                        avg_price: Decimal::ZERO,
                        state: OrderStatus::New,
                        reason: None,
                        created_ns: entry.timestamp_ns,
                        last_update_ns: entry.timestamp_ns,
                    };
                    let _ = order.accept(entry.timestamp_ns);
                    self.reservations
                        .insert(client_order_id.clone(), (rec.paying_asset, rec.reservation));
                    self.orders.insert(client_order_id, order);
                }
                WalEntryType::OrderRejected => {
                    // Rejected orders never mutated balances/positions and
                    // the payload here carries too little to reconstruct a
                    // full `Order`; nothing to replay.
                }
                WalEntryType::OrderCanceled => {
                    let rec: WalOrderCanceled = serde_json::from_slice(&entry.payload)?;
                    if let Ok(id) = ClientOrderId::new(rec.client_order_id) {
                        if let Some(order) = self.orders.get_mut(&id) {
                            let _ = order.cancel(entry.timestamp_ns);
                        }
                        self.reservations.remove(&id);
                    }
                }
                WalEntryType::Fill => {
                    let rec: WalFill = serde_json::from_slice(&entry.payload)?;
                    if let Ok(id) = ClientOrderId::new(rec.client_order_id) {
                        if let Some(mut order) = self.orders.get(&id).cloned() {
                            let _ = order.apply_fill(rec.qty, rec.price, entry.timestamp_ns);

                            if order.state.is_terminal() {
                                self.reservations.remove(&id);
                            } else {
                                let consumed = match order.side {
                                    Side::Buy => rec.qty * rec.price,
                                    Side::Sell => rec.qty,
                                };
                                if let Some((_, remaining)) = self.reservations.get_mut(&id) {
                                    *remaining = (*remaining - consumed).max(Decimal::ZERO);
                                }
                            }

                            let position = self.positions.entry(order.symbol.clone()).or_insert_with(Position::flat);
                            apply_fill_to_position(position, order.side, rec.qty, rec.price);
                            self.orders.insert(id, order);
                        }
                    }
                }
                WalEntryType::BalanceUpdate => {
                    let rec: WalBalanceUpdate = serde_json::from_slice(&entry.payload)?;
                    self.balances.insert(
                        rec.asset,
                        Balance {
                            free: rec.free,
                            locked: rec.locked,
                        },
                    );
                }
            }
            Ok(())
        })
    }
}
