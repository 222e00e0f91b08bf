//! Property-based invariant checks spanning the order FSM, Engine State,
//! the WAL, the event stream, and the priority event loop. Unit tests next
//! to each module check specific transitions; these proptests throw
//! thousands of randomized sequences at the same invariants to catch edge
//! cases a handful of example-based cases miss.

use approx::assert_abs_diff_eq;
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::NamedTempFile;

use veloz_core::config::RiskConfig;
use veloz_core::core::event::{EventEmitter, EventKind};
use veloz_core::core::event_loop::{EventLoop, Priority};
use veloz_core::core::ids::ClientOrderId;
use veloz_core::core::types::{Order, OrderFlags, OrderStatus, OrderType, Side, TimeInForce};
use veloz_core::engine::{EngineState, MarkBook, PlaceOrderRequest, PlaceOutcome};
use veloz_core::risk::CircuitBreakerConfig;
use veloz_core::wal::replication::ReplicationSender;
use veloz_core::wal::{FsyncMode, Wal};

fn fresh_order(qty: Decimal) -> Order {
    Order {
        client_order_id: ClientOrderId::new("c1").unwrap(),
        venue_order_id: None,
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        order_qty: qty,
        limit_price: Some(Decimal::new(50_000, 0)),
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

fn engine_state() -> EngineState<Vec<u8>> {
    let wal_file = NamedTempFile::new().unwrap();
    let wal = Wal::open(wal_file.path(), FsyncMode::Every, u64::MAX).unwrap();
    let marks = Arc::new(MarkBook::new());
    marks.update("BTCUSDT", Decimal::new(50_000, 0));
    let mut state = EngineState::new(
        "acct-1",
        RiskConfig {
            maker_fee_bps: Decimal::ZERO,
            taker_fee_bps: Decimal::ZERO,
            ..RiskConfig::default()
        },
        CircuitBreakerConfig::default(),
        marks,
        wal,
        ReplicationSender::disabled(),
        EventEmitter::new(Vec::new(), 0),
    );
    state.deposit("USDT", Decimal::new(1_000_000, 0));
    state
}

fn qty_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..=1_000_000i64).prop_map(|v| Decimal::new(v, 4)) // 0.0001 .. 100.0000
}

proptest! {
    /// executed_qty never exceeds order_qty, through any sequence of fills
    /// that individually respect `remaining_qty`.
    #[test]
    fn executed_qty_never_exceeds_order_qty(
        order_qty in qty_strategy(),
        fill_fractions in prop::collection::vec(1u32..=100u32, 1..8),
    ) {
        let mut order = fresh_order(order_qty);
        order.accept(1).unwrap();

        for frac in fill_fractions {
            let remaining = order.remaining_qty();
            if remaining <= Decimal::ZERO {
                break;
            }
            let qty = (remaining * Decimal::new(frac as i64, 2)).max(Decimal::new(1, 8)).min(remaining);
            if order.apply_fill(qty, Decimal::new(50_000, 0), 1).is_err() {
                break;
            }
            prop_assert!(order.executed_qty <= order.order_qty);
        }
        prop_assert!(order.executed_qty <= order_qty);
    }

    /// The FSM's running Decimal average fill price agrees with a
    /// from-scratch f64 weighted mean over the same fills, to within
    /// floating-point tolerance — a cross-check on `apply_fill`'s
    /// incremental average against the textbook formula.
    #[test]
    fn running_average_price_matches_float_weighted_mean(
        order_qty in qty_strategy(),
        fills in prop::collection::vec((1u32..=100u32, 40_000i64..=60_000i64), 1..6),
    ) {
        let mut order = fresh_order(order_qty);
        order.accept(1).unwrap();

        let mut weighted_sum = 0.0f64;
        let mut total_qty = 0.0f64;

        for (frac, price) in fills {
            let remaining = order.remaining_qty();
            if remaining <= Decimal::ZERO {
                break;
            }
            let qty = (remaining * Decimal::new(frac as i64, 2)).max(Decimal::new(1, 8)).min(remaining);
            let price = Decimal::new(price, 0);
            if order.apply_fill(qty, price, 1).is_err() {
                break;
            }
            let qty_f: f64 = qty.to_string().parse().unwrap();
            let price_f: f64 = price.to_string().parse().unwrap();
            weighted_sum += qty_f * price_f;
            total_qty += qty_f;
        }

        prop_assume!(total_qty > 0.0);
        let expected_avg = weighted_sum / total_qty;
        let actual_avg: f64 = order.avg_price.to_string().parse().unwrap();
        assert_abs_diff_eq!(actual_avg, expected_avg, epsilon = 1e-6 * expected_avg.max(1.0));
    }

    /// Filling an order never changes total balance (free + locked) for
    /// either asset beyond what the fee policy takes from the quote asset:
    /// the base asset credited always equals the quote asset's locked
    /// reservation released, modulo the configured (here zero) fee.
    #[test]
    fn fill_conserves_total_quote_plus_base_value(
        qty in qty_strategy(),
        fill_frac in 1u32..=100u32,
    ) {
        let mut state = engine_state();
        let outcome = state.place_order(
            PlaceOrderRequest {
                client_order_id: Some(ClientOrderId::new("p1").unwrap()),
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                qty,
                limit_price: Some(Decimal::new(50_000, 0)),
                time_in_force: TimeInForce::Gtc,
                flags: OrderFlags::default(),
            },
            1,
        );
        let Ok(PlaceOutcome::Accepted(_)) = outcome else {
            return Ok(());
        };

        let usdt_before = state.balance("USDT").total();
        let fill_qty = (qty * Decimal::new(fill_frac as i64, 2)).min(qty).max(Decimal::new(1, 8));

        state.apply_executor_event(
            veloz_core::execution::ExecutorEvent::Fill {
                client_order_id: ClientOrderId::new("p1").unwrap(),
                venue_order_id: None,
                qty: fill_qty,
                price: Decimal::new(50_000, 0),
                ts_ns: 2,
                sequence: 1,
                is_maker: true,
            },
            2,
        ).unwrap();

        let usdt_after = state.balance("USDT").total();
        let btc_after = state.balance("BTC").total();

        // Zero fees in this config: USDT spent equals BTC received * price.
        prop_assert_eq!(usdt_before - usdt_after, btc_after * Decimal::new(50_000, 0));
    }

    /// Replaying the same WAL onto two independently-constructed, fresh
    /// `EngineState`s always reconstructs identical order and balance maps
    /// — recovery is a deterministic function of the log, not of whatever
    /// state happened to exist before replay started.
    #[test]
    fn wal_replay_is_deterministic_across_fresh_states(
        qty in qty_strategy(),
        fill_frac in 1u32..=100u32,
    ) {
        let wal_file = NamedTempFile::new().unwrap();
        let wal_path = wal_file.path().to_path_buf();
        {
            let wal = Wal::open(&wal_path, FsyncMode::Every, u64::MAX).unwrap();
            let marks = Arc::new(MarkBook::new());
            marks.update("BTCUSDT", Decimal::new(50_000, 0));
            let mut writer = EngineState::new(
                "acct-1",
                RiskConfig {
                    maker_fee_bps: Decimal::ZERO,
                    taker_fee_bps: Decimal::ZERO,
                    ..RiskConfig::default()
                },
                CircuitBreakerConfig::default(),
                marks,
                wal,
                ReplicationSender::disabled(),
                EventEmitter::new(Vec::new(), 0),
            );
            writer.deposit("USDT", Decimal::new(1_000_000, 0));

            let outcome = writer.place_order(
                PlaceOrderRequest {
                    client_order_id: Some(ClientOrderId::new("w1").unwrap()),
                    symbol: "BTCUSDT".to_string(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    qty,
                    limit_price: Some(Decimal::new(50_000, 0)),
                    time_in_force: TimeInForce::Gtc,
                    flags: OrderFlags::default(),
                },
                1,
            );
            let Ok(PlaceOutcome::Accepted(_)) = outcome else {
                return Ok(());
            };
            let fill_qty = (qty * Decimal::new(fill_frac as i64, 2)).min(qty).max(Decimal::new(1, 8));
            writer.apply_executor_event(
                veloz_core::execution::ExecutorEvent::Fill {
                    client_order_id: ClientOrderId::new("w1").unwrap(),
                    venue_order_id: None,
                    qty: fill_qty,
                    price: Decimal::new(50_000, 0),
                    ts_ns: 2,
                    sequence: 1,
                    is_maker: true,
                },
                2,
            ).unwrap();
        }

        let build = || {
            let marks = Arc::new(MarkBook::new());
            marks.update("BTCUSDT", Decimal::new(50_000, 0));
            let fresh_wal_file = NamedTempFile::new().unwrap();
            let fresh_wal = Wal::open(fresh_wal_file.path(), FsyncMode::Every, u64::MAX).unwrap();
            let mut state = EngineState::new(
                "acct-1",
                RiskConfig::default(),
                CircuitBreakerConfig::default(),
                marks,
                fresh_wal,
                ReplicationSender::disabled(),
                EventEmitter::new(Vec::new(), 0),
            );
            state.restore_from_wal(&wal_path).unwrap();
            state
        };

        let state_a = build();
        let state_b = build();

        prop_assert_eq!(state_a.balance("USDT"), state_b.balance("USDT"));
        prop_assert_eq!(state_a.balance("BTC"), state_b.balance("BTC"));
        prop_assert_eq!(
            state_a.order("w1").map(|o| o.executed_qty),
            state_b.order("w1").map(|o| o.executed_qty)
        );
    }

    /// `EventEmitter::emit` hands out strictly increasing ids no matter how
    /// many events of whatever kind are emitted, with no gaps.
    #[test]
    fn event_emitter_ids_are_strictly_monotonic_and_dense(kinds in prop::collection::vec(0u8..6u8, 1..50)) {
        let emitter = EventEmitter::new(Vec::new(), 0);
        let mut last = 0u64;
        for (i, k) in kinds.iter().enumerate() {
            let kind = match k {
                0 => EventKind::Market,
                1 => EventKind::OrderUpdate,
                2 => EventKind::Fill,
                3 => EventKind::OrderState,
                4 => EventKind::Account,
                _ => EventKind::Error,
            };
            let id = emitter.emit(kind, 1, &serde_json::json!({"i": i})).unwrap();
            if i > 0 {
                prop_assert_eq!(id, last + 1);
            }
            last = id;
        }
    }

    /// A batch of tasks posted before the loop starts (all immediately
    /// ready, no delays) always dispatches in non-increasing priority
    /// order, higher priorities first, regardless of post order.
    #[test]
    fn ready_tasks_dispatch_in_priority_order(priorities in prop::collection::vec(0u8..4u8, 1..20)) {
        let event_loop = Arc::new(EventLoop::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let as_priority = |v: u8| match v {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        };

        for p in &priorities {
            let seen = Arc::clone(&seen);
            let priority = as_priority(*p);
            event_loop.post(Box::new(move || seen.lock().unwrap().push(priority)), priority, vec![]);
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let seen_marker = Arc::clone(&seen);
        event_loop.post(Box::new(move || { seen_marker.lock().unwrap().push(Priority::Low); tx.send(()).ok(); }), Priority::Low, vec![]);

        let el_run = Arc::clone(&event_loop);
        let handle = std::thread::spawn(move || el_run.run());
        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        event_loop.stop();
        handle.join().unwrap();

        let seen = seen.lock().unwrap();
        for window in seen.windows(2) {
            prop_assert!(window[0] >= window[1]);
        }
    }

    /// Placing the same client order id twice is always a no-op rejection
    /// the second time, whatever the second request's contents are.
    #[test]
    fn duplicate_client_order_id_is_always_rejected(
        qty_a in qty_strategy(),
        qty_b in qty_strategy(),
        side_b in prop::bool::ANY,
    ) {
        let mut state = engine_state();
        let first = state.place_order(
            PlaceOrderRequest {
                client_order_id: Some(ClientOrderId::new("dup-1").unwrap()),
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                qty: qty_a,
                limit_price: Some(Decimal::new(50_000, 0)),
                time_in_force: TimeInForce::Gtc,
                flags: OrderFlags::default(),
            },
            1,
        ).unwrap();
        prop_assume!(matches!(first, PlaceOutcome::Accepted(_)));

        let second = state.place_order(
            PlaceOrderRequest {
                client_order_id: Some(ClientOrderId::new("dup-1").unwrap()),
                symbol: "BTCUSDT".to_string(),
                side: if side_b { Side::Buy } else { Side::Sell },
                order_type: OrderType::Limit,
                qty: qty_b,
                limit_price: Some(Decimal::new(50_000, 0)),
                time_in_force: TimeInForce::Gtc,
                flags: OrderFlags::default(),
            },
            2,
        ).unwrap();

        prop_assert!(matches!(second, PlaceOutcome::Duplicate { .. }));
    }
}
