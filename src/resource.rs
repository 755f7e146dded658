//! Resources: named, parameterized factories for a derived sub-graph (§4.5).
//!
//! Grounded on `original_source/.../classic/resource.py::Resource` and
//! `ResourceParams.instantiate` — a name, a parameter model, and a factory from
//! validated parameters to a leaf collection. The Python validates with pydantic;
//! this crate validates with `serde_json::from_value::<P>`, where `P: DeserializeOwned`
//! is the typed parameter record. Resources of different `P` are stored behind one
//! object-safe `Resource` trait the same way collections are stored behind `DynNode`
//! (`src/collection.rs`) — the concrete type is known only at registration time.

use crate::collection::DynNode;
use crate::engine::ComputeEngine;
use crate::error::EngineError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

/// Object-safe face of a resource, stored in the service's resource table.
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;

    /// Validates `params` and builds (or reuses, through [`ComputeEngine::derive`]'s
    /// idempotent naming) the resource's sub-graph, returning the leaf node and the
    /// canonical JSON re-encoding of the validated parameters — used as the
    /// fingerprint input so that equivalent JSON (differing only in key order or
    /// incidental whitespace) maps to the same instance.
    fn instantiate(
        &self,
        engine: &Arc<ComputeEngine>,
        params: Value,
    ) -> Result<(Value, Arc<dyn DynNode>), EngineError>;
}

/// A resource whose parameter type is `P` and whose factory builds the sub-graph
/// against a live engine handle.
pub struct TypedResource<P, F> {
    name: String,
    factory: F,
    _params: PhantomData<fn(P)>,
}

impl<P, F> TypedResource<P, F>
where
    P: DeserializeOwned + Serialize + Send + Sync + 'static,
    F: Fn(&Arc<ComputeEngine>, P) -> Result<Arc<dyn DynNode>, EngineError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        TypedResource {
            name: name.into(),
            factory,
            _params: PhantomData,
        }
    }
}

impl<P, F> Resource for TypedResource<P, F>
where
    P: DeserializeOwned + Serialize + Send + Sync + 'static,
    F: Fn(&Arc<ComputeEngine>, P) -> Result<Arc<dyn DynNode>, EngineError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(
        &self,
        engine: &Arc<ComputeEngine>,
        params: Value,
    ) -> Result<(Value, Arc<dyn DynNode>), EngineError> {
        let validated: P = serde_json::from_value(params)
            .map_err(|err| EngineError::Validation(err.to_string()))?;
        let canonical =
            serde_json::to_value(&validated).expect("validated params must re-serialize");
        let leaf = (self.factory)(engine, validated)?;
        Ok((canonical, leaf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Collection;
    use crate::mapper::OneToOne;
    use serde::Deserialize;

    #[derive(Deserialize, Serialize)]
    struct ScaleParams {
        factor: i32,
    }

    #[test]
    fn instantiate_validates_and_builds_the_leaf() {
        let engine = ComputeEngine::new();
        let base: Arc<Collection<String, i32>> = engine.base("numbers").unwrap();
        base.set("a".to_string(), 2).unwrap();

        let resource = TypedResource::new("scaled", |engine: &Arc<ComputeEngine>, params: ScaleParams| {
            let factor = params.factor;
            let base: Arc<Collection<String, i32>> = engine.base("numbers")?;
            let derived = engine.derive::<_, _, i32, _>(
                &base,
                OneToOne::new(move |v: &i32| Some(v * factor)),
                "scale",
                factor,
            )?;
            Ok(derived as Arc<dyn DynNode>)
        });

        let (canonical, leaf) = resource
            .instantiate(&engine, serde_json::json!({ "factor": 3 }))
            .unwrap();
        assert_eq!(canonical, serde_json::json!({ "factor": 3 }));
        assert_eq!(
            leaf.snapshot(),
            vec![(serde_json::json!("a"), serde_json::json!(6))]
        );
    }

    #[test]
    fn instantiate_rejects_malformed_params() {
        let engine = ComputeEngine::new();
        let resource = TypedResource::new("scaled", |engine: &Arc<ComputeEngine>, params: ScaleParams| {
            let factor = params.factor;
            let base: Arc<Collection<String, i32>> = engine.base("numbers")?;
            let derived = engine.derive::<_, _, i32, _>(
                &base,
                OneToOne::new(move |v: &i32| Some(v * factor)),
                "scale",
                factor,
            )?;
            Ok(derived as Arc<dyn DynNode>)
        });
        let result = resource.instantiate(&engine, serde_json::json!({ "factor": "not a number" }));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
