//! JSON admin surface over the trigger and status operations.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use disco_sync::{RunNowRequest, RunNowResponse, TriggerError, TriggerService};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "disco-web";

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub trigger: TriggerService,
}

impl AppState {
    pub fn new(trigger: TriggerService) -> Self {
        Self { trigger }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunBody {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    params: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn resolved(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sources", get(sources_handler))
        .route("/api/sources/{id}/run", post(run_now_handler))
        .route("/api/history", get(history_handler))
        .route("/api/events", get(events_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admin api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.trigger.sources()).into_response()
}

async fn run_now_handler(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
    body: Bytes,
) -> Response {
    let body: RunBody = if body.iter().all(u8::is_ascii_whitespace) {
        RunBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => return client_error(StatusCode::BAD_REQUEST, format!("invalid body: {err}")),
        }
    };

    let request = RunNowRequest {
        source_id,
        force: body.force,
        params: body.params,
    };
    match state.trigger.run_now(request).await {
        Ok(outcome @ RunNowResponse::Enqueued { .. }) => {
            (StatusCode::ACCEPTED, Json(outcome)).into_response()
        }
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => trigger_error(err),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.trigger.status(query.resolved()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => trigger_error(err),
    }
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.trigger.recent_events(query.resolved()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => trigger_error(err),
    }
}

fn client_error(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

fn trigger_error(err: TriggerError) -> Response {
    match err {
        TriggerError::UnknownSource(_) => client_error(StatusCode::NOT_FOUND, err.to_string()),
        TriggerError::InvalidSchedule { .. } => {
            client_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        TriggerError::Queue(_) | TriggerError::Persistence(_) => {
            error!(error = %err, "admin request failed");
            client_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
