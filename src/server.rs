use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::batch::{self, BatchDeps};
use crate::dispatch::Dispatcher;
use crate::model::{BatchRunResult, JobKind};

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<BatchDeps>,
    pub dispatcher: Arc<Dispatcher>,
    pub secret: String,
}

#[derive(Serialize)]
struct TriggerResponse {
    #[serde(flatten)]
    result: BatchRunResult,
    timestamp: String,
}

#[derive(Deserialize)]
struct EventBody {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Bearer-secret gate for the automation routes. Anything but an exact match
/// is rejected before a handler runs.
async fn require_cron_secret(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected = format!("Bearer {}", state.secret);
    if provided == expected {
        return next.run(req).await;
    }
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

/// Build the router: authenticated automation triggers plus the public
/// event-ingestion and health routes.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/automation/{job}", get(trigger_job).post(trigger_job))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    let public = Router::new()
        .route("/events", post(ingest_event))
        .route("/health", get(health));

    protected
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn trigger_job(State(state): State<AppState>, Path(job): Path<String>) -> Response {
    let kind: JobKind = match job.parse() {
        Ok(kind) => kind,
        Err(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "success": false,
                    "error": format!("unknown job '{job}'"),
                    "timestamp": now(),
                })),
            )
                .into_response();
        }
    };

    match batch::run_batch(&state.deps, kind).await {
        Ok(result) => (
            StatusCode::OK,
            Json(TriggerResponse {
                result,
                timestamp: now(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(?err, job = kind.as_str(), "batch run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": err.to_string(),
                    "timestamp": now(),
                })),
            )
                .into_response()
        }
    }
}

/// Accepts an event and returns immediately; the dispatch happens on a
/// background task so producers never wait on channel latency.
async fn ingest_event(
    State(state): State<AppState>,
    body: Result<Json<EventBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return missing_event_response();
    };
    let event = body.event.filter(|e| !e.trim().is_empty());
    let (Some(event), Some(Value::Object(payload))) = (event, body.payload) else {
        return missing_event_response();
    };

    state.dispatcher.dispatch_background(event, payload);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "message": "Event queued" })),
    )
        .into_response()
}

fn missing_event_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Missing event or payload" })),
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
