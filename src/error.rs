//! Typed error hierarchy for the engine (§7 of SPEC_FULL.md).
//!
//! `SubscriberLost` and `ReentrantUpdate` from the spec are deliberately absent here:
//! both are handled entirely locally (logged and recovered) and never escape a public
//! operation, so they carry no caller-visible variant.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// A boxed compute-function failure, surfaced from a derived collection's compute
/// closure. Opaque to the engine beyond its `Display`/`Error` impl.
pub type ComputeError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("parameters failed validation: {0}")]
    Validation(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("unknown stream instance: {0}")]
    UnknownInstance(String),

    #[error("registering dependency {dependent} -> {dependency} would create a cycle")]
    CycleRejected {
        dependent: String,
        dependency: String,
    },

    #[error("compute failed for collection `{collection}`: {source}")]
    ComputeFailure {
        collection: String,
        #[source]
        source: ComputeError,
    },

    #[error("collection `{0}` is derived; external writes are forbidden")]
    DerivedCollectionWrite(String),

    #[error("collection `{0}` already exists with a different key/value type")]
    TypeMismatch(String),

    #[error("a node named `{0}` is not registered in the graph")]
    UnknownNode(String),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::UnknownResource(_) => StatusCode::NOT_FOUND,
            EngineError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            EngineError::CycleRejected { .. } => StatusCode::BAD_REQUEST,
            EngineError::ComputeFailure { .. } => StatusCode::BAD_REQUEST,
            EngineError::DerivedCollectionWrite(_) => StatusCode::BAD_REQUEST,
            EngineError::TypeMismatch(_) => StatusCode::BAD_REQUEST,
            EngineError::UnknownNode(_) => StatusCode::NOT_FOUND,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400() {
        let err = EngineError::Validation("bad params".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unknown_instance_maps_to_404() {
        let err = EngineError::UnknownInstance("abc".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
