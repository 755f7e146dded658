//! HTTP/SSE surface (§4.9, §6). Routes requests onto [`crate::service::Service`].
//!
//! Grounded on `estuary-flow/crates/oidc-discovery-server/src/lib.rs`'s
//! `Router::new().route(...).with_state(Arc<_>)` shape and `Result<Json<_>, StatusCode>`
//! handler convention (here `EngineError` plays the role of the status code, via its
//! `IntoResponse` impl in `src/error.rs`).

use crate::error::EngineError;
use crate::service::Service;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// A single `/v1/streams/:id` path serves all three methods from §6's table: the
/// path segment means a resource name for `POST` and an instance id for `GET`/`DELETE`.
pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route(
            "/v1/streams/:id",
            post(create_stream).get(open_stream).delete(delete_stream),
        )
        .with_state(service)
}

async fn create_stream(
    State(service): State<Arc<Service>>,
    Path(resource_name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, EngineError> {
    let (instance_id, reused) = service.create_stream(&resource_name, params)?;
    Ok(Json(json!({ "instance_id": instance_id, "reused": reused })))
}

async fn open_stream(
    State(service): State<Arc<Service>>,
    Path(instance_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, EngineError> {
    let receiver = service.open_stream(&instance_id)?;
    let stream = ReceiverStream::new(receiver).map(|event| Ok(event.into_axum_event()));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn delete_stream(
    State(service): State<Arc<Service>>,
    Path(instance_id): Path<String>,
) -> Result<Json<Value>, EngineError> {
    service.delete_stream(&instance_id)?;
    Ok(Json(json!({ "status": "success" })))
}
