//! The service facade (§4.8): create/open/delete stream, independent of transport.
//!
//! Grounded on `original_source/.../classic/service.py`'s three Quart route handlers,
//! factored out from the HTTP layer itself the way `oidc-discovery-server` separates
//! its `AppState` business logic from its route functions.

use crate::engine::ComputeEngine;
use crate::error::EngineError;
use crate::registry::InstanceRegistry;
use crate::resource::Resource;
use crate::subscriber::SseEvent;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Service {
    engine: Arc<ComputeEngine>,
    resources: FxHashMap<String, Arc<dyn Resource>>,
    registry: InstanceRegistry,
}

impl Service {
    pub fn new(
        engine: Arc<ComputeEngine>,
        resources: Vec<Arc<dyn Resource>>,
        queue_capacity: usize,
    ) -> Self {
        let resources = resources
            .into_iter()
            .map(|resource| (resource.name().to_string(), resource))
            .collect();
        Service {
            engine,
            resources,
            registry: InstanceRegistry::new(queue_capacity),
        }
    }

    pub fn engine(&self) -> &Arc<ComputeEngine> {
        &self.engine
    }

    /// §4.8 "Create stream": look up the resource, reuse an existing instance for
    /// identical params if one exists, else validate and instantiate a new one.
    /// Returns `(instance_id, reused)`.
    pub fn create_stream(
        &self,
        resource_name: &str,
        params: Value,
    ) -> Result<(String, bool), EngineError> {
        if let Some(existing_id) = self.registry.find_existing(resource_name, &params) {
            return Ok((existing_id, true));
        }
        let resource = self
            .resources
            .get(resource_name)
            .ok_or_else(|| EngineError::UnknownResource(resource_name.to_string()))?;
        let (canonical_params, leaf) = resource.instantiate(&self.engine, params)?;
        let (instance, reused) = self.registry.create(resource_name, canonical_params, leaf);
        Ok((instance.id.clone(), reused))
    }

    /// §4.8 "Open stream": subscribe and hand back the receiving half of the
    /// bounded event queue for the caller to drain as a long-lived stream.
    pub fn open_stream(&self, instance_id: &str) -> Result<mpsc::Receiver<SseEvent>, EngineError> {
        self.registry.subscribe(instance_id)
    }

    /// §4.8 "Delete stream".
    pub fn delete_stream(&self, instance_id: &str) -> Result<(), EngineError> {
        self.registry.destroy(instance_id)
    }

    /// Runs one idle-sweep pass (§4.6); intended to be called from a periodic
    /// `tokio::time::interval` task alongside the HTTP listener.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        self.registry.sweep_idle(max_idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Collection, DynNode};
    use crate::mapper::OneToOne;
    use crate::resource::TypedResource;
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize, Serialize)]
    struct DoubleParams {}

    fn make_service() -> Service {
        let engine = ComputeEngine::new();
        let base: Arc<Collection<String, i32>> = engine.base("numbers").unwrap();
        base.set("a".to_string(), 2).unwrap();

        let resource = TypedResource::new("doubled", |engine: &Arc<ComputeEngine>, _: DoubleParams| {
            let base: Arc<Collection<String, i32>> = engine.base("numbers")?;
            let derived = engine.derive::<_, _, i32, _>(
                &base,
                OneToOne::new(|v: &i32| Some(v * 2)),
                "double",
                (),
            )?;
            Ok(derived as Arc<dyn DynNode>)
        });

        Service::new(engine, vec![Arc::new(resource)], 8)
    }

    #[test]
    fn create_stream_on_unknown_resource_errors() {
        let service = make_service();
        let result = service.create_stream("missing", serde_json::json!({}));
        assert!(matches!(result, Err(EngineError::UnknownResource(_))));
    }

    #[test]
    fn repeated_create_stream_reuses_the_instance() {
        let service = make_service();
        let (first, reused_first) = service
            .create_stream("doubled", serde_json::json!({}))
            .unwrap();
        assert!(!reused_first);
        let (second, reused_second) = service
            .create_stream("doubled", serde_json::json!({}))
            .unwrap();
        assert!(reused_second);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn open_stream_then_write_delivers_init_then_update() {
        let service = make_service();
        let (instance_id, _) = service
            .create_stream("doubled", serde_json::json!({}))
            .unwrap();
        let mut rx = service.open_stream(&instance_id).unwrap();

        let init = rx.recv().await.unwrap();
        assert!(matches!(init, SseEvent::Init { .. }));

        let engine = service.engine().clone();
        let base: Arc<Collection<String, i32>> = engine.base("numbers").unwrap();
        base.set("b".to_string(), 5).unwrap();

        let update = rx.recv().await.unwrap();
        match update {
            SseEvent::Update { key, value } => {
                assert_eq!(key, serde_json::json!("b"));
                assert_eq!(value, Some(serde_json::json!(10)));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn delete_stream_on_unknown_instance_errors() {
        let service = make_service();
        assert!(matches!(
            service.delete_stream("missing"),
            Err(EngineError::UnknownInstance(_))
        ));
    }
}
