//! Collections (§3, §4.1): the keyed stores that sit at the graph's nodes.
//!
//! Grounded on `original_source/.../core/collection.py::Collection` and
//! `compute_graph.py::ComputedCollection`. The Python source models base and
//! derived collections as a base class and a subclass; here both are the same
//! `Collection<K, V>` with an optional compute closure, since the only behavioral
//! difference is "does this collection get its contents from `set`/`delete`, or
//! from a function over its dependencies" — a field, not a type hierarchy.

use crate::change::{Change, ErasedChange};
use crate::engine::ComputeEngine;
use crate::error::{ComputeError, EngineError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// A callback invoked once per [`ErasedChange`] dispatched for a collection, in the
/// order the engine produces them. Used by the subscription layer to turn engine
/// output into SSE events; never invoked while the engine's internal lock is held.
pub type ChangeCallback = Box<dyn Fn(&ErasedChange) + Send + Sync>;

/// The type-erased face of a [`Collection`] that the graph/engine operate against,
/// since the engine walks a heterogeneous set of collections by name without
/// knowing any one collection's concrete `K`/`V`.
pub trait DynNode: Send + Sync {
    fn name(&self) -> &str;

    fn is_derived(&self) -> bool;

    /// For a base collection, drains and erases whatever changes `set`/`delete`
    /// staged since the last recompute. For a derived collection, invokes the
    /// compute function, diffs the result against current contents, replaces the
    /// contents, and erases the diff. Returns `Err` only for a derived collection
    /// whose compute function failed (§4.3's "Failure semantics").
    fn recompute(&self) -> Result<Vec<ErasedChange>, EngineError>;

    /// Invokes every registered change callback with every change, in order.
    fn dispatch(&self, changes: &[ErasedChange]);

    /// A point-in-time `[key, value]` snapshot of the full contents.
    fn snapshot(&self) -> Vec<(serde_json::Value, serde_json::Value)>;

    fn add_change_callback(&self, callback: ChangeCallback);

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct Collection<K, V> {
    name: String,
    data: Mutex<IndexMap<K, V>>,
    last_modified: Mutex<Instant>,
    /// Changes staged by `set`/`delete` on a base collection, awaiting the engine's
    /// next recompute pass. Always empty for a derived collection.
    pending: Mutex<Vec<Change<K, V>>>,
    /// `None` for a base collection. `Some` for a derived collection, whose
    /// contents are produced entirely by this closure.
    compute: Option<Box<dyn Fn() -> Result<IndexMap<K, V>, ComputeError> + Send + Sync>>,
    callbacks: Mutex<Vec<ChangeCallback>>,
    engine: Weak<ComputeEngine>,
}

impl<K, V> fmt::Debug for Collection<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("derived", &self.compute.is_some())
            .finish()
    }
}

impl<K, V> Collection<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new_base(name: String, engine: Weak<ComputeEngine>) -> Self {
        Collection {
            name,
            data: Mutex::new(IndexMap::new()),
            last_modified: Mutex::new(Instant::now()),
            pending: Mutex::new(Vec::new()),
            compute: None,
            callbacks: Mutex::new(Vec::new()),
            engine,
        }
    }

    pub(crate) fn new_derived(
        name: String,
        engine: Weak<ComputeEngine>,
        compute: Box<dyn Fn() -> Result<IndexMap<K, V>, ComputeError> + Send + Sync>,
    ) -> Self {
        Collection {
            name,
            data: Mutex::new(IndexMap::new()),
            last_modified: Mutex::new(Instant::now()),
            pending: Mutex::new(Vec::new()),
            compute: Some(compute),
            callbacks: Mutex::new(Vec::new()),
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_derived(&self) -> bool {
        self.compute.is_some()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.data.lock().get(key).cloned()
    }

    pub fn get_all(&self) -> IndexMap<K, V> {
        self.data.lock().clone()
    }

    pub fn iter_items(&self) -> Vec<(K, V)> {
        self.data
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn last_modified(&self) -> Instant {
        *self.last_modified.lock()
    }

    fn engine(&self) -> Result<Arc<ComputeEngine>, EngineError> {
        self.engine
            .upgrade()
            .ok_or_else(|| EngineError::UnknownNode(self.name.clone()))
    }

    /// Sets `key` to `value`. A no-op (no change recorded, no recomputation
    /// triggered) if `value` equals the current value, per SPEC_FULL.md §8's
    /// round-trip property. Forbidden on a derived collection.
    pub fn set(&self, key: K, value: V) -> Result<(), EngineError> {
        if self.is_derived() {
            return Err(EngineError::DerivedCollectionWrite(self.name.clone()));
        }
        let old_value = {
            let mut data = self.data.lock();
            let old = data.get(&key).cloned();
            if old.as_ref() == Some(&value) {
                return Ok(());
            }
            data.insert(key.clone(), value.clone());
            old
        };
        *self.last_modified.lock() = Instant::now();
        self.pending
            .lock()
            .push(Change::new(key, old_value, Some(value)));
        self.engine()?.recompute(&self.name)
    }

    /// Deletes `key`. A no-op if the key is absent. Forbidden on a derived
    /// collection.
    pub fn delete(&self, key: &K) -> Result<(), EngineError> {
        if self.is_derived() {
            return Err(EngineError::DerivedCollectionWrite(self.name.clone()));
        }
        let old_value = {
            let mut data = self.data.lock();
            data.shift_remove(key)
        };
        let Some(old_value) = old_value else {
            return Ok(());
        };
        *self.last_modified.lock() = Instant::now();
        self.pending
            .lock()
            .push(Change::new(key.clone(), Some(old_value), None));
        self.engine()?.recompute(&self.name)
    }

    /// Computes the new contents (derived only) and the diff against the current
    /// contents, replacing them. Mapper-emitted duplicate output keys within one
    /// compute pass are last-write-wins, per SPEC_FULL.md §9 (flagged, not an
    /// error): the duplicate simply never appears twice in `new_data` because it's
    /// a map keyed by output key.
    fn recompute_contents(&self) -> Result<Vec<Change<K, V>>, EngineError> {
        let compute = self
            .compute
            .as_ref()
            .expect("recompute_contents only called on derived collections");
        let new_data = compute().map_err(|source| EngineError::ComputeFailure {
            collection: self.name.clone(),
            source,
        })?;

        let mut data = self.data.lock();
        let mut changes = Vec::new();

        for (key, old_value) in data.iter() {
            if !new_data.contains_key(key) {
                changes.push(Change::new(key.clone(), Some(old_value.clone()), None));
            }
        }
        for (key, new_value) in new_data.iter() {
            match data.get(key) {
                Some(old_value) if old_value == new_value => {}
                Some(old_value) => changes.push(Change::new(
                    key.clone(),
                    Some(old_value.clone()),
                    Some(new_value.clone()),
                )),
                None => changes.push(Change::new(key.clone(), None, Some(new_value.clone()))),
            }
        }

        *data = new_data;
        drop(data);
        if !changes.is_empty() {
            *self.last_modified.lock() = Instant::now();
        }
        Ok(changes)
    }
}

impl<K, V> DynNode for Collection<K, V>
where
    K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
    V: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_derived(&self) -> bool {
        self.compute.is_some()
    }

    fn recompute(&self) -> Result<Vec<ErasedChange>, EngineError> {
        let changes = if self.is_derived() {
            self.recompute_contents()?
        } else {
            std::mem::take(&mut *self.pending.lock())
        };
        Ok(changes.iter().map(Change::erase).collect())
    }

    fn dispatch(&self, changes: &[ErasedChange]) {
        let callbacks = self.callbacks.lock();
        for change in changes {
            for callback in callbacks.iter() {
                callback(change);
            }
        }
    }

    fn snapshot(&self) -> Vec<(serde_json::Value, serde_json::Value)> {
        self.data
            .lock()
            .iter()
            .map(|(k, v)| {
                (
                    serde_json::to_value(k).expect("collection key must serialize to JSON"),
                    serde_json::to_value(v).expect("collection value must serialize to JSON"),
                )
            })
            .collect()
    }

    fn add_change_callback(&self, callback: ChangeCallback) {
        self.callbacks.lock().push(callback);
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
