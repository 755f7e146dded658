//! The coordinated-update engine (§4.3 of SPEC_FULL.md).
//!
//! Grounded on `compute_graph.py::ComputeGraph.recompute_invalidated` /
//! `_compute_single_node` / `_topological_sort`. The Python engine guards a single
//! in-flight update with a `_coordinated_update_in_progress` bool and a
//! `_computation_in_progress` set, relying on the GIL for thread-safety. Rust has no
//! GIL, so the same guarantee (one coordinated pass at a time, safe reentry from the
//! same thread) is built on `parking_lot::ReentrantMutex<RefCell<EngineState>>`: the
//! `RefCell` borrow is always released before calling into a node's `recompute()` or
//! `dispatch()`, since those calls run user-supplied closures that may themselves
//! call back into `recompute` (a compute or callback writing to a base collection).
//! A `pending_roots` queue folds any such reentrant root into the pass already in
//! flight rather than starting a second one, and every discovered change is
//! dispatched exactly once, after the whole pass — including every reentrant
//! addition — has settled.

use crate::collection::{Collection, DynNode};
use crate::change::ErasedChange;
use crate::error::EngineError;
use crate::fingerprint::fingerprint;
use crate::graph::DependencyGraph;
use crate::mapper::Mapper;
use indexmap::IndexMap;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Instant;

#[derive(Default)]
struct EngineState {
    graph: DependencyGraph,
    nodes: FxHashMap<String, Arc<dyn DynNode>>,
    pending_roots: VecDeque<String>,
    update_in_progress: bool,
}

/// Owns the dependency graph and every collection registered against it. Cheap to
/// clone (it's always held as `Arc<ComputeEngine>`); every `Collection` holds a
/// `Weak` back-reference so it can ask its engine to recompute without the engine
/// needing to hold a canonical `Arc<Collection<K, V>>` of every concrete type.
pub struct ComputeEngine {
    self_weak: Weak<ComputeEngine>,
    inner: ReentrantMutex<RefCell<EngineState>>,
}

impl ComputeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| ComputeEngine {
            self_weak: weak.clone(),
            inner: ReentrantMutex::new(RefCell::new(EngineState::default())),
        })
    }

    /// Returns the base collection registered under `name`, creating it if absent.
    /// A second call with the same name returns the existing collection (per
    /// SPEC_FULL.md §9's `add_node` decision), erroring [`EngineError::TypeMismatch`]
    /// if it was created with different `K`/`V`.
    pub fn base<K, V>(&self, name: impl Into<String>) -> Result<Arc<Collection<K, V>>, EngineError>
    where
        K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
        V: Clone + PartialEq + Serialize + Send + Sync + 'static,
    {
        let name = name.into();
        let guard = self.inner.lock();
        if let Some(existing) = guard.borrow().nodes.get(&name).cloned() {
            return downcast_node(existing, &name);
        }
        let collection = Arc::new(Collection::new_base(name.clone(), self.self_weak.clone()));
        {
            let mut state = guard.borrow_mut();
            state.graph.add_node(&name);
            state
                .nodes
                .insert(name.clone(), collection.clone() as Arc<dyn DynNode>);
        }
        Ok(collection)
    }

    /// Derives a collection from `source` by applying `mapper` element-wise (§4.4).
    /// The derived collection's name is deterministic in `source`, `mapper_id` and
    /// `args`, so calling `derive` twice with equivalent arguments returns the same
    /// collection rather than building a duplicate (§4.4's naming contract).
    pub fn derive<K, V, V2, M>(
        &self,
        source: &Arc<Collection<K, V>>,
        mapper: M,
        mapper_id: &str,
        args: impl Serialize,
    ) -> Result<Arc<Collection<K, V2>>, EngineError>
    where
        K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
        V: Clone + PartialEq + Serialize + Send + Sync + 'static,
        V2: Clone + PartialEq + Serialize + Send + Sync + 'static,
        M: Mapper<K, V, V2> + 'static,
    {
        let derived_name = format!(
            "{}::map::{}::{:016x}",
            source.name(),
            mapper_id,
            fingerprint(&args)
        );

        let guard = self.inner.lock();
        if let Some(existing) = guard.borrow().nodes.get(&derived_name).cloned() {
            return downcast_node(existing, &derived_name);
        }

        let source_name = source.name().to_string();
        let source_handle = source.clone();
        let compute: Box<dyn Fn() -> Result<IndexMap<K, V2>, crate::error::ComputeError> + Send + Sync> =
            Box::new(move || {
                let mut new_data: IndexMap<K, V2> = IndexMap::new();
                for (key, value) in source_handle.iter_items() {
                    for (out_key, out_value) in mapper.map_element(&key, &value) {
                        new_data.insert(out_key, out_value);
                    }
                }
                Ok(new_data)
            });

        let derived = Arc::new(Collection::new_derived(
            derived_name.clone(),
            self.self_weak.clone(),
            compute,
        ));

        guard.borrow_mut().graph.add_node(&derived_name);
        // Dropped before `add_dependency` re-locks: `ReentrantMutex` permits
        // re-entry from this thread regardless, but there's no need to hold two
        // borrows of the same `RefCell` open at once.
        drop(guard);
        self.add_dependency(&derived_name, &source_name)?;
        let guard = self.inner.lock();
        guard
            .borrow_mut()
            .nodes
            .insert(derived_name, derived.clone() as Arc<dyn DynNode>);
        Ok(derived)
    }

    /// Registers an edge directly. Exposed for constructing dependency wiring
    /// outside of [`derive`] (e.g. a resource factory's hand-assembled pipeline) and
    /// for testing cycle rejection in isolation.
    pub fn add_dependency(&self, dependent: &str, dependency: &str) -> Result<(), EngineError> {
        let guard = self.inner.lock();
        guard.borrow_mut().graph.add_dependency(dependent, dependency)
    }

    /// Runs (or folds into an in-flight) coordinated update rooted at `starting`:
    /// invalidate everything transitively downstream, recompute it in dependency
    /// order, then dispatch every resulting change once the whole pass — including
    /// any reentrant roots discovered along the way — has settled.
    pub fn recompute(&self, starting: &str) -> Result<(), EngineError> {
        let guard = self.inner.lock();
        {
            let mut state = guard.borrow_mut();
            state.pending_roots.push_back(starting.to_string());
            if state.update_in_progress {
                // A compute closure or change callback on this same thread is
                // already mid-pass; fold this root into it instead of recursing.
                return Ok(());
            }
            state.update_in_progress = true;
        }

        let (all_changes, outcome) = self.drain_pending_roots(&guard);

        guard.borrow_mut().update_in_progress = false;

        // Dispatch whatever prefix was successfully recomputed regardless of how the
        // pass ended: a mid-pass `ComputeFailure` must not suppress the callbacks for
        // nodes already committed before the failing one (SPEC_FULL §7).
        for (name, changes) in &all_changes {
            let node = guard.borrow().nodes.get(name).cloned();
            if let Some(node) = node {
                node.dispatch(changes);
            }
        }
        outcome
    }

    /// Drains `pending_roots`, recomputing every invalidated node in dependency
    /// order. Always returns the `(name, changes)` pairs produced before either the
    /// queue emptied or a node's `recompute()` failed, so the caller can dispatch
    /// that prefix no matter which happened.
    fn drain_pending_roots(
        &self,
        guard: &ReentrantMutexGuard<'_, RefCell<EngineState>>,
    ) -> (Vec<(String, Vec<ErasedChange>)>, Result<(), EngineError>) {
        let mut all_changes = Vec::new();
        loop {
            let root = match guard.borrow_mut().pending_roots.pop_front() {
                Some(root) => root,
                None => return (all_changes, Ok(())),
            };

            let invalidated = guard.borrow_mut().graph.invalidate(&root);
            if invalidated.is_empty() {
                continue;
            }
            let order = guard.borrow().graph.topo_sort(&invalidated);

            for name in order {
                let node = guard.borrow().nodes.get(&name).cloned();
                let Some(node) = node else { continue };
                // No borrow is held across this call: `node.recompute()` may run
                // user code that calls back into `recompute`, which re-locks this
                // same `ReentrantMutex` on this same thread.
                let changes = match node.recompute() {
                    Ok(changes) => changes,
                    Err(err) => return (all_changes, Err(err)),
                };
                guard.borrow_mut().graph.mark_computed(&name, Instant::now());
                if !changes.is_empty() {
                    all_changes.push((name, changes));
                }
            }
        }
    }
}

fn downcast_node<K, V>(node: Arc<dyn DynNode>, name: &str) -> Result<Arc<Collection<K, V>>, EngineError>
where
    K: 'static,
    V: 'static,
{
    node.as_any_arc()
        .downcast::<Collection<K, V>>()
        .map_err(|_| EngineError::TypeMismatch(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::OneToOne;
    use parking_lot::Mutex;

    #[test]
    fn derive_propagates_a_single_change() {
        let engine = ComputeEngine::new();
        let r: Arc<Collection<String, i32>> = engine.base("r").unwrap();
        let doubled = engine
            .derive::<_, _, i32, _>(&r, OneToOne::new(|v: &i32| Some(v * 2)), "double", ())
            .unwrap();

        r.set("a".to_string(), 3).unwrap();
        assert_eq!(doubled.get(&"a".to_string()), Some(6));
    }

    #[test]
    fn derive_is_idempotent_for_equivalent_args() {
        let engine = ComputeEngine::new();
        let r: Arc<Collection<String, i32>> = engine.base("r").unwrap();
        let a = engine
            .derive::<_, _, i32, _>(&r, OneToOne::new(|v: &i32| Some(v * 2)), "double", ())
            .unwrap();
        let b = engine
            .derive::<_, _, i32, _>(&r, OneToOne::new(|v: &i32| Some(v * 2)), "double", ())
            .unwrap();
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn multi_level_derivation_propagates_transitively() {
        let engine = ComputeEngine::new();
        let r: Arc<Collection<String, i32>> = engine.base("r").unwrap();
        let doubled = engine
            .derive::<_, _, i32, _>(&r, OneToOne::new(|v: &i32| Some(v * 2)), "double", ())
            .unwrap();
        let plus_one = engine
            .derive::<_, _, i32, _>(&doubled, OneToOne::new(|v: &i32| Some(v + 1)), "inc", ())
            .unwrap();

        r.set("a".to_string(), 5).unwrap();
        assert_eq!(doubled.get(&"a".to_string()), Some(10));
        assert_eq!(plus_one.get(&"a".to_string()), Some(11));
    }

    #[test]
    fn add_dependency_rejects_cycles_through_the_engine() {
        let engine = ComputeEngine::new();
        let _a: Arc<Collection<String, i32>> = engine.base("a").unwrap();
        let _b: Arc<Collection<String, i32>> = engine.base("b").unwrap();
        engine.add_dependency("b", "a").unwrap();
        assert!(engine.add_dependency("a", "b").is_err());
    }

    #[test]
    fn reentrant_write_from_a_callback_folds_into_its_own_pass() {
        let engine = ComputeEngine::new();
        let a: Arc<Collection<String, i32>> = engine.base("a").unwrap();
        let b: Arc<Collection<String, i32>> = engine.base("b").unwrap();

        let b_for_callback = b.clone();
        DynNode::add_change_callback(
            &*a,
            Box::new(move |change| {
                if change.new_value == Some(serde_json::json!(1)) {
                    b_for_callback.set("y".to_string(), 1).unwrap();
                }
            }),
        );

        a.set("x".to_string(), 1).unwrap();
        assert_eq!(b.get(&"y".to_string()), Some(1));
    }

    #[test]
    fn base_lookup_is_idempotent_by_name() {
        let engine = ComputeEngine::new();
        let a: Arc<Collection<String, i32>> = engine.base("shared").unwrap();
        a.set("k".to_string(), 1).unwrap();
        let a_again: Arc<Collection<String, i32>> = engine.base("shared").unwrap();
        assert_eq!(a_again.get(&"k".to_string()), Some(1));
    }

    #[test]
    fn base_type_mismatch_is_reported() {
        let engine = ComputeEngine::new();
        let _a: Arc<Collection<String, i32>> = engine.base("shared").unwrap();
        let mismatched = engine.base::<String, String>("shared");
        assert!(matches!(mismatched, Err(EngineError::TypeMismatch(_))));
    }

    #[test]
    fn callback_order_matches_dispatch_order() {
        let engine = ComputeEngine::new();
        let r: Arc<Collection<String, i32>> = engine.base("r").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        DynNode::add_change_callback(
            &*r,
            Box::new(move |change| {
                seen2.lock().push(change.key.clone());
            }),
        );
        r.set("a".to_string(), 1).unwrap();
        r.set("b".to_string(), 2).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![serde_json::json!("a"), serde_json::json!("b")]
        );
    }

    #[test]
    fn compute_failure_still_dispatches_the_already_recomputed_prefix() {
        let engine = ComputeEngine::new();
        let r: Arc<Collection<String, i32>> = engine.base("r").unwrap();
        let m1 = engine
            .derive::<_, _, i32, _>(&r, OneToOne::new(|v: &i32| Some(v + 1)), "inc", ())
            .unwrap();

        // Built directly rather than through `derive`, so its compute function can
        // fail — no `Mapper` impl in this crate ever does.
        let failing_name = format!("{}::map::fail", m1.name());
        let failing: Arc<Collection<String, i32>> = Arc::new(Collection::new_derived(
            failing_name.clone(),
            engine.self_weak.clone(),
            Box::new(|| Err("boom".into())),
        ));
        {
            let guard = engine.inner.lock();
            guard.borrow_mut().graph.add_node(&failing_name);
        }
        engine.add_dependency(&failing_name, m1.name()).unwrap();
        {
            let guard = engine.inner.lock();
            guard
                .borrow_mut()
                .nodes
                .insert(failing_name, failing as Arc<dyn DynNode>);
        }

        let m1_dispatches = Arc::new(Mutex::new(0usize));
        let m1_dispatches2 = m1_dispatches.clone();
        DynNode::add_change_callback(
            &*m1,
            Box::new(move |_| {
                *m1_dispatches2.lock() += 1;
            }),
        );

        let result = r.set("a".to_string(), 1);
        assert!(matches!(result, Err(EngineError::ComputeFailure { .. })));
        // `m1` is downstream of `r` and upstream of the failing node, so it must
        // have committed its new contents and fired its callback despite the
        // later failure.
        assert_eq!(m1.get(&"a".to_string()), Some(2));
        assert_eq!(*m1_dispatches.lock(), 1);
    }
}
