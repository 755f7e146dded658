//! A single-key mutation record produced by a collection write or a recomputation diff.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Describes a mutation to one key of one collection.
///
/// `old_value = None, new_value = Some(_)` is an insertion. `old_value = Some(_),
/// new_value = None` is a deletion. Both present is an update. A `Change` with
/// `old_value == new_value` is never constructed by this crate's own write paths,
/// but [`Change::is_noop`] is exposed so callers building changes by hand (tests,
/// custom adapters) can check the same invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<K, V> {
    pub key: K,
    pub old_value: Option<V>,
    pub new_value: Option<V>,
    pub timestamp: SystemTime,
}

impl<K, V> Change<K, V> {
    pub fn new(key: K, old_value: Option<V>, new_value: Option<V>) -> Self {
        Change {
            key,
            old_value,
            new_value,
            timestamp: SystemTime::now(),
        }
    }
}

impl<K, V: PartialEq> Change<K, V> {
    pub fn is_noop(&self) -> bool {
        self.old_value == self.new_value
    }
}

/// Type-erased form of [`Change`], used once a change crosses into the engine's
/// dynamic dispatch path (recompute loop, callback dispatch, SSE framing) where the
/// concrete `K`/`V` of a given collection is no longer in scope.
#[derive(Debug, Clone)]
pub struct ErasedChange {
    pub key: serde_json::Value,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub timestamp_millis: u128,
}

impl<K, V> Change<K, V>
where
    K: Serialize,
    V: Serialize,
{
    pub fn erase(&self) -> ErasedChange {
        ErasedChange {
            key: serde_json::to_value(&self.key).expect("collection key must serialize to JSON"),
            old_value: self
                .old_value
                .as_ref()
                .map(|v| serde_json::to_value(v).expect("collection value must serialize to JSON")),
            new_value: self
                .new_value
                .as_ref()
                .map(|v| serde_json::to_value(v).expect("collection value must serialize to JSON")),
            timestamp_millis: self
                .timestamp
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_detection() {
        let c = Change::new("a", Some(1), Some(1));
        assert!(c.is_noop());
        let c = Change::new("a", Some(1), Some(2));
        assert!(!c.is_noop());
    }

    #[test]
    fn erase_round_trips_through_json() {
        let c = Change::new("a".to_string(), None, Some(42i32));
        let erased = c.erase();
        assert_eq!(erased.key, serde_json::json!("a"));
        assert_eq!(erased.old_value, None);
        assert_eq!(erased.new_value, Some(serde_json::json!(42)));
    }
}
