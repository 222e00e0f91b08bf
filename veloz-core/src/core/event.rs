//! Outbound event stream: newline-delimited JSON, monotonic `event_id`.
//!
//! Every emitted event must correspond to a committed state mutation —
//! callers are required to append the WAL entry first and only then call
//! [`EventEmitter::emit`], mirroring the teacher's journal-then-notify
//! ordering in `execution/journal.rs`.

use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum EventKind {
    Market,
    OrderUpdate,
    Fill,
    OrderState,
    Account,
    Error,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::Market => "market",
            EventKind::OrderUpdate => "order_update",
            EventKind::Fill => "fill",
            EventKind::OrderState => "order_state",
            EventKind::Account => "account",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    event_id: u64,
    #[serde(rename = "type")]
    kind: &'a str,
    ts_ns: i64,
    #[serde(flatten)]
    payload: &'a T,
}

/// Appends a dense, monotonic `event_id` and writes one JSON object per
/// line to the wrapped sink. `emit` is at-least-once to the transport: a
/// write error is returned to the caller rather than swallowed, so the
/// caller can decide whether to retry or escalate.
pub struct EventEmitter<W: Write> {
    sink: Mutex<W>,
    next_id: AtomicU64,
}

impl<W: Write> EventEmitter<W> {
    /// `resume_from` is the last `event_id` persisted before restart (0 if
    /// none); the next emitted id is `resume_from + 1`.
    pub fn new(sink: W, resume_from: u64) -> Self {
        Self {
            sink: Mutex::new(sink),
            next_id: AtomicU64::new(resume_from + 1),
        }
    }

    pub fn emit<T: Serialize>(&self, kind: EventKind, ts_ns: i64, payload: &T) -> io::Result<u64> {
        let event_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            event_id,
            kind: kind.as_str(),
            ts_ns,
            payload,
        };
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        let mut sink = self.sink.lock().expect("event emitter sink mutex poisoned");
        sink.write_all(&line)?;
        sink.flush()
    }

    pub fn last_event_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_ids_are_monotonic_and_dense() {
        let emitter = EventEmitter::new(Vec::new(), 0);
        let a = emitter.emit(EventKind::Market, 1, &json!({"symbol": "BTCUSDT", "price": "50000"})).unwrap();
        let b = emitter.emit(EventKind::Error, 2, &json!({"message": "x"})).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(emitter.last_event_id(), 2);
    }

    #[test]
    fn resumes_event_id_sequence_after_restart() {
        let emitter = EventEmitter::new(Vec::new(), 41);
        let a = emitter.emit(EventKind::Account, 1, &json!({"balances": []})).unwrap();
        assert_eq!(a, 42);
    }

    #[test]
    fn payload_is_flattened_alongside_envelope_fields() {
        let sink: Vec<u8> = Vec::new();
        let emitter = EventEmitter::new(sink, 0);
        emitter
            .emit(EventKind::Fill, 10, &json!({"client_order_id": "a1", "symbol": "BTCUSDT", "qty": "0.01", "price": "50000"}))
            .unwrap();
        let guard = emitter.sink.lock().unwrap();
        let text = String::from_utf8(guard.clone()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed["event_id"], 1);
        assert_eq!(parsed["type"], "fill");
        assert_eq!(parsed["client_order_id"], "a1");
    }
}
