use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mend_core::connection_manager::ConnectionManager;
use mend_core::diagnostics::{ActionReport, Diagnostics, ResolutionOutcome, StatusReport};
use mend_core::trial::ConnectionBackend;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const OVERRIDE_CONNECTED: &str = "Connected successfully!";
pub const OVERRIDE_FAILED: &str = "Connection failed. Check URL.";
pub const RETRY_CONNECTED: &str = "Fixed! Refresh page.";
pub const RETRY_FAILED: &str = "Retry finished but still failed.";

type Manager<B> = Arc<ConnectionManager<B>>;

#[derive(Debug, Deserialize)]
struct OverrideBody {
    #[serde(default)]
    url: Option<String>,
}

pub fn router<B>(manager: Manager<B>) -> Router
where
    B: ConnectionBackend + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status::<B>))
        .route("/api/debug/db", get(diagnostics::<B>))
        .route("/api/debug/config", post(set_override::<B>))
        .route("/api/debug/fix", get(retry::<B>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(manager)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status<B>(State(manager): State<Manager<B>>) -> Json<StatusReport>
where
    B: ConnectionBackend + 'static,
{
    Json(manager.status())
}

async fn diagnostics<B>(State(manager): State<Manager<B>>) -> Json<Diagnostics>
where
    B: ConnectionBackend + 'static,
{
    Json(manager.diagnostics())
}

async fn set_override<B>(
    State(manager): State<Manager<B>>,
    body: Option<Json<OverrideBody>>,
) -> Response
where
    B: ConnectionBackend + 'static,
{
    let url = body
        .and_then(|Json(body)| body.url)
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    let Some(url) = url else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "URL is required" })),
        )
            .into_response();
    };

    info!("manual connection override submitted");
    let outcome = run_detached(manager, move |manager| async move {
        manager.apply_override(url).await
    })
    .await;
    Json(ActionReport::from_outcome(
        &outcome,
        OVERRIDE_CONNECTED,
        OVERRIDE_FAILED,
    ))
    .into_response()
}

async fn retry<B>(State(manager): State<Manager<B>>) -> Json<ActionReport>
where
    B: ConnectionBackend + 'static,
{
    info!("connection retry requested");
    let outcome = run_detached(manager, |manager| async move { manager.resolve().await }).await;
    Json(ActionReport::from_outcome(
        &outcome,
        RETRY_CONNECTED,
        RETRY_FAILED,
    ))
}

// A client hanging up must not abandon a run halfway, so the run gets its
// own task and the handler only waits for it.
async fn run_detached<B, F, Fut>(manager: Manager<B>, run: F) -> ResolutionOutcome
where
    B: ConnectionBackend + 'static,
    F: FnOnce(Manager<B>) -> Fut,
    Fut: std::future::Future<Output = ResolutionOutcome> + Send + 'static,
{
    let fallback = manager.state();
    match tokio::spawn(run(manager)).await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            error!(error = %join_error, "resolution task did not complete");
            ResolutionOutcome::failed(
                fallback.run,
                format!("resolution task did not complete: {join_error}"),
                Vec::new(),
            )
        }
    }
}
