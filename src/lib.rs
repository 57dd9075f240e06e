pub mod engine;
pub mod error;
pub mod extractor;
pub mod metrics;
pub mod policy;
pub mod probe;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod signaling;
pub mod transcode;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, options, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use engine::ContentEngine;
use error::ResolveError;
use registry::{StreamDescriptor, StreamRegistry};
use resolver::{DeclaredKind, StreamResolver};
use transcode::TranscodeSettings;

pub struct AppState {
    pub registry: StreamRegistry,
    pub resolver: StreamResolver,
    pub engine: Arc<dyn ContentEngine>,
    pub transcode: TranscodeSettings,
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/api/resolve", post(resolve_handler))
        .route("/stream/{id}", get(stream_handler))
        .route("/stream/{id}", options(stream_options_handler))
        .route("/metadata/{id}", get(metadata_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    Response::builder()
        .status(404)
        .body(Body::from("Not found"))
        .unwrap()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "online": true,
        "version": env!("CARGO_PKG_VERSION"),
        "streams": state.registry.len().await,
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    metrics::gather_metrics()
}

#[derive(Deserialize)]
struct ResolveRequest {
    input: String,
    kind: Option<DeclaredKind>,
}

fn descriptor_json(descriptor: &StreamDescriptor) -> serde_json::Value {
    json!({
        "streamId": descriptor.id,
        "name": descriptor.name,
        "size": descriptor.size_bytes,
        "duration": descriptor.duration_seconds,
        "state": descriptor.state,
        "streams": descriptor.tracks,
    })
}

fn json_error(status: u16, message: String) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(json!({ "error": message }).to_string()))
        .unwrap()
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResolveRequest>,
) -> Response {
    info!(
        "Resolve request: input=\"{}\" kind={:?}",
        request.input.chars().take(80).collect::<String>(),
        request.kind
    );
    match state.resolver.resolve(&request.input, request.kind).await {
        Ok(descriptor) => Json(descriptor_json(&descriptor)).into_response(),
        Err(e) => {
            warn!("Resolve failed: input=\"{}\" err={}", request.input, e);
            let status = match &e {
                ResolveError::NotFound(_) => 404,
                ResolveError::UpstreamRemote(_) => 502,
                ResolveError::UnsupportedInput | ResolveError::Engine(_) => 500,
            };
            json_error(status, e.to_string())
        }
    }
}

async fn metadata_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(descriptor) = state.registry.get(&id).await else {
        return json_error(404, format!("unknown stream {id}"));
    };
    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(descriptor_json(&descriptor).to_string()))
        .unwrap()
}

async fn stream_options_handler() -> impl IntoResponse {
    Response::builder()
        .status(204)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, OPTIONS")
        .header("Access-Control-Allow-Headers", "Range")
        .body(Body::empty())
        .unwrap()
}

async fn stream_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    let range = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok());

    let Some(descriptor) = state.registry.get(&id).await else {
        info!("HTTP stream 404: id={} UA=\"{}\"", id, user_agent);
        return json_error(404, format!("unknown stream {id}"));
    };

    let transcode = policy::needs_transcode(descriptor.kind, &descriptor.name);
    info!(
        "HTTP stream request: id={} name=\"{}\" kind={:?} mode={} Range=\"{}\" UA=\"{}\"",
        id,
        descriptor.name,
        descriptor.kind,
        if transcode { "transcode" } else { "direct" },
        range.unwrap_or("<none>"),
        user_agent
    );

    if transcode {
        // Forward-only remux; Range is not honored in this mode.
        server::serve_transcoded(&state.transcode, state.engine.clone(), &descriptor).await
    } else {
        server::serve_direct(state.engine.clone(), &descriptor, range).await
    }
}
