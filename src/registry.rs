//! Instance registry: dedup, lookup, and lifetime of resource instances (§4.6).
//!
//! Grounded on `original_source/.../core/resource.py::ResourceManager`
//! (`_get_param_hash`, `find_existing_instance`, `create_instance`, `destroy_instance`,
//! `subscribe`, `_notify_subscribers`). Fingerprinting is `crate::fingerprint::fingerprint`
//! over the validated-and-reserialized parameter JSON (§4.6's "keys sorted lexically,
//! values encoded canonically").

use crate::change::ErasedChange;
use crate::collection::DynNode;
use crate::error::EngineError;
use crate::fingerprint::fingerprint;
use crate::subscriber::{SseEvent, SubscriberSet};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct ResourceInstance {
    pub id: String,
    pub resource_name: String,
    pub params: Value,
    fingerprint_key: (String, u64),
    pub created_at: Instant,
    last_accessed: Mutex<Instant>,
    pub leaf: Arc<dyn DynNode>,
    subscribers: SubscriberSet,
}

impl ResourceInstance {
    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }
}

/// Maps `instance_id -> ResourceInstance` and `(resource_name, fingerprint) -> instance_id`.
/// Deduplicates by the second map; `destroy` removes from both.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: Mutex<FxHashMap<String, Arc<ResourceInstance>>>,
    by_fingerprint: Mutex<FxHashMap<(String, u64), String>>,
    queue_capacity: usize,
}

impl InstanceRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        InstanceRegistry {
            instances: Mutex::new(FxHashMap::default()),
            by_fingerprint: Mutex::new(FxHashMap::default()),
            queue_capacity,
        }
    }

    pub fn find_existing(&self, resource_name: &str, params: &Value) -> Option<String> {
        let key = (resource_name.to_string(), fingerprint(params));
        self.by_fingerprint.lock().get(&key).cloned()
    }

    /// Returns the instance for `(resource_name, params)`, minting one around `leaf`
    /// if none exists yet. The returned bool is `true` if an existing instance was
    /// reused instead of a new one being created.
    pub fn create(
        &self,
        resource_name: &str,
        params: Value,
        leaf: Arc<dyn DynNode>,
    ) -> (Arc<ResourceInstance>, bool) {
        let fingerprint_key = (resource_name.to_string(), fingerprint(&params));

        if let Some(existing_id) = self.by_fingerprint.lock().get(&fingerprint_key).cloned() {
            if let Ok(instance) = self.get(&existing_id) {
                return (instance, true);
            }
        }

        let id = Uuid::new_v4().to_string();
        let instance = Arc::new(ResourceInstance {
            id: id.clone(),
            resource_name: resource_name.to_string(),
            params,
            fingerprint_key: fingerprint_key.clone(),
            created_at: Instant::now(),
            last_accessed: Mutex::new(Instant::now()),
            leaf: leaf.clone(),
            subscribers: SubscriberSet::new(),
        });

        // Weak, not a strong `Arc`: once `destroy` removes this instance from
        // `instances` below, this closure must not be the thing keeping it alive —
        // the leaf collection (and its callback list) outlives any one instance.
        let weak_instance: Weak<ResourceInstance> = Arc::downgrade(&instance);
        leaf.add_change_callback(Box::new(move |change: &ErasedChange| {
            if let Some(instance) = weak_instance.upgrade() {
                instance.subscribers.dispatch(&SseEvent::from_change(change));
            }
        }));

        self.instances.lock().insert(id.clone(), instance.clone());
        self.by_fingerprint.lock().insert(fingerprint_key, id);
        (instance, false)
    }

    pub fn get(&self, instance_id: &str) -> Result<Arc<ResourceInstance>, EngineError> {
        let instance = self
            .instances
            .lock()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
        instance.touch();
        Ok(instance)
    }

    /// Registers a bounded queue as a new subscriber, delivering one `init` snapshot
    /// event immediately and every subsequent `update`/`close` as they're dispatched.
    pub fn subscribe(&self, instance_id: &str) -> Result<mpsc::Receiver<SseEvent>, EngineError> {
        let instance = self.get(instance_id)?;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let init = SseEvent::Init {
            items: instance.leaf.snapshot(),
        };
        if tx.try_send(init).is_err() {
            tracing::warn!(instance_id, "failed to deliver initial snapshot");
        }
        instance.subscribers.add(tx);
        Ok(rx)
    }

    pub fn destroy(&self, instance_id: &str) -> Result<(), EngineError> {
        let instance = self
            .instances
            .lock()
            .remove(instance_id)
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
        self.by_fingerprint.lock().remove(&instance.fingerprint_key);
        instance.subscribers.close("instance destroyed");
        tracing::debug!(instance_id, "instance destroyed");
        Ok(())
    }

    /// Destroys every instance whose `last_accessed` is older than `max_idle`.
    /// Returns how many were reclaimed.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .instances
            .lock()
            .values()
            .filter(|instance| now.duration_since(instance.last_accessed()) > max_idle)
            .map(|instance| instance.id.clone())
            .collect();
        for id in &stale {
            let _ = self.destroy(id);
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "idle sweep reclaimed instances");
        }
        stale.len()
    }
}
