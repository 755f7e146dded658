//! Per-instance subscriber fan-out (§4.7) and SSE event framing (§6).
//!
//! Grounded on `original_source/.../core/resource.py`'s subscriber set and
//! `core/types.py::SSEMessage`. The Python keeps a `weakref.ref` to a queue some
//! other strong owner (the request handler) holds; there's no equivalent second
//! owner here, so this crate keeps a plain [`tokio::sync::mpsc::Sender`] per
//! subscriber and gets the same externally observable behavior — a disconnected or
//! backed-up client is pruned, never accumulates — by evicting on the first failed
//! `try_send` instead of failing a weak upgrade.

use crate::change::ErasedChange;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// One event pushed down a subscriber's stream. Mirrors `SSEMessage`'s three
/// concrete shapes from §4.7.
#[derive(Debug, Clone)]
pub enum SseEvent {
    /// Full point-in-time snapshot of the leaf collection at subscription time.
    Init { items: Vec<(Value, Value)> },
    /// A single key's change; `value: None` denotes deletion.
    Update { key: Value, value: Option<Value> },
    /// Terminal event; no further events follow it on this subscriber.
    Close { reason: String },
}

impl SseEvent {
    pub fn from_change(change: &ErasedChange) -> Self {
        SseEvent::Update {
            key: change.key.clone(),
            value: change.new_value.clone(),
        }
    }

    fn event_name(&self) -> &'static str {
        match self {
            SseEvent::Init { .. } => "init",
            SseEvent::Update { .. } => "update",
            SseEvent::Close { .. } => "close",
        }
    }

    fn payload(&self) -> Value {
        match self {
            SseEvent::Init { items } => Value::Array(
                items
                    .iter()
                    .map(|(k, v)| Value::Array(vec![k.clone(), v.clone()]))
                    .collect(),
            ),
            // Wrapped in an outer array, same shape as `init`'s list of pairs, so a
            // client decoding both event kinds the same way doesn't mistake the pair
            // itself for a two-element array of `[key, values]`.
            SseEvent::Update { key, value } => Value::Array(vec![Value::Array(vec![
                key.clone(),
                Value::Array(value.iter().cloned().collect()),
            ])]),
            SseEvent::Close { reason } => serde_json::json!({ "reason": reason }),
        }
    }

    /// Renders this event exactly as `SSEMessage.format()` does: an optional `id:`
    /// line, an `event:` line, one `data:` line per `\n`-split chunk of the
    /// JSON-encoded payload, an optional `retry:` line, then a blank terminator.
    pub fn format(&self, id: Option<&str>, retry_ms: Option<u64>) -> String {
        let mut out = String::new();
        if let Some(id) = id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        out.push_str("event: ");
        out.push_str(self.event_name());
        out.push('\n');
        let data = serde_json::to_string(&self.payload()).expect("SSE payload must serialize");
        for line in data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        if let Some(retry_ms) = retry_ms {
            out.push_str("retry: ");
            out.push_str(&retry_ms.to_string());
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub fn into_axum_event(self) -> axum::response::sse::Event {
        axum::response::sse::Event::default()
            .event(self.event_name())
            .json_data(self.payload())
            .expect("SSE payload must serialize to JSON")
    }
}

/// The live subscriber set for one resource instance. Dispatch never blocks: a full
/// or closed channel evicts its subscriber on the spot (§4.7's back-pressure policy).
#[derive(Default)]
pub struct SubscriberSet {
    senders: Mutex<Vec<mpsc::Sender<SseEvent>>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        SubscriberSet::default()
    }

    pub fn add(&self, sender: mpsc::Sender<SseEvent>) {
        self.senders.lock().push(sender);
    }

    pub fn dispatch(&self, event: &SseEvent) {
        self.senders
            .lock()
            .retain(|sender| sender.try_send(event.clone()).is_ok());
    }

    /// Sends a terminal `close` to every live subscriber, then drops them all.
    pub fn close(&self, reason: &str) {
        let event = SseEvent::Close {
            reason: reason.to_string(),
        };
        let mut senders = self.senders.lock();
        for sender in senders.iter() {
            let _ = sender.try_send(event.clone());
        }
        senders.clear();
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }
}
