//! HTTP API
//!
//! JSON over HTTP for the catalog, runs and browsers, plus a WebSocket that
//! streams run and install events. Errors are `{"error": "<message>"}` with
//! a status code chosen by error kind.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use qaflow_common::Browser;
use qaflow_engine::{
    artifact::ArtifactError, parser, CancelOutcome, EngineError, InstallEvent, RunEngine, RunEvent,
    RunOptions, Variant,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub struct AppState {
    pub engine: RunEngine,
}

type SharedState = Arc<AppState>;

/// Engine error rendered as a JSON response
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl From<qaflow_common::Error> for ApiError {
    fn from(e: qaflow_common::Error) -> Self {
        ApiError(e.into())
    }
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::AlreadyRunning { .. } | EngineError::RunInProgress { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::Environment(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Artifact(ArtifactError::OutsideRoot(_)) => StatusCode::FORBIDDEN,
        EngineError::Artifact(ArtifactError::NotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Artifact(ArtifactError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let EngineError::AlreadyRunning { run_id: Some(run_id) } = &self.0 {
            body["active_run_id"] = serde_json::json!(run_id);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/parse", post(parse_handler))
        .route("/api/parse/script", post(parse_script_handler))
        .route("/api/projects", get(list_projects_handler).post(create_project_handler))
        .route("/api/projects/:project_id", delete(delete_project_handler))
        .route(
            "/api/projects/:project_id/test-cases",
            get(list_test_cases_handler).post(create_test_case_handler),
        )
        .route(
            "/api/test-cases/:test_case_id",
            get(get_test_case_handler)
                .put(update_test_case_handler)
                .delete(delete_test_case_handler),
        )
        .route("/api/test-cases/:test_case_id/runs", get(run_history_handler))
        .route("/api/runs", post(start_run_handler))
        .route("/api/runs/active", get(active_run_handler))
        .route("/api/runs/:run_id", get(run_status_handler))
        .route("/api/runs/:run_id/cancel", post(cancel_run_handler))
        .route("/api/runs/:run_id/steps", get(step_results_handler))
        .route("/api/runs/:run_id/report", get(run_report_handler))
        .route("/api/browsers", get(browser_status_handler))
        .route("/api/browsers/:browser/install", post(install_browser_handler))
        .route("/api/artifacts", get(artifact_handler))
        .route("/api/events", get(events_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails
pub async fn serve(engine: RunEngine, addr: SocketAddr) -> anyhow::Result<()> {
    let state = Arc::new(AppState { engine });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "qaflowd",
        "version": qaflow_common::VERSION,
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
}

#[derive(Debug, Deserialize)]
struct ParseRequest {
    text: String,
}

async fn parse_handler(Json(req): Json<ParseRequest>) -> ApiResult<Json<parser::Parsed>> {
    let parsed = parser::parse(&req.text).map_err(EngineError::from)?;
    Ok(Json(parsed))
}

#[derive(Debug, Deserialize)]
struct ParseScriptRequest {
    steps: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ParseScriptResponse {
    valid: bool,
    lines: Vec<parser::LineReport>,
}

async fn parse_script_handler(Json(req): Json<ParseScriptRequest>) -> impl IntoResponse {
    let lines = parser::validate_steps(&req.steps);
    let valid = lines.iter().all(|l| l.error.is_none());
    Json(ParseScriptResponse { valid, lines })
}

async fn list_projects_handler(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_projects()?))
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
}

async fn create_project_handler(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    let project = state.engine.create_project(&req.name)?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn delete_project_handler(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_project(&project_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_test_cases_handler(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_test_cases(&project_id)?))
}

#[derive(Debug, Deserialize)]
struct CreateTestCaseRequest {
    title: String,
    #[serde(default)]
    steps: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TestCaseResponse {
    test_case: qaflow_common::TestCase,
    steps: Vec<qaflow_common::Step>,
}

async fn create_test_case_handler(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateTestCaseRequest>,
) -> ApiResult<impl IntoResponse> {
    let (test_case, steps) = state
        .engine
        .create_test_case(&project_id, &req.title, &req.steps)?;
    Ok((StatusCode::CREATED, Json(TestCaseResponse { test_case, steps })))
}

async fn get_test_case_handler(
    State(state): State<SharedState>,
    Path(test_case_id): Path<String>,
) -> ApiResult<Json<TestCaseResponse>> {
    let test_case = state.engine.get_test_case(&test_case_id)?;
    let steps = state.engine.list_steps(&test_case_id)?;
    Ok(Json(TestCaseResponse { test_case, steps }))
}

#[derive(Debug, Deserialize)]
struct UpdateStepsRequest {
    steps: Vec<String>,
}

async fn update_test_case_handler(
    State(state): State<SharedState>,
    Path(test_case_id): Path<String>,
    Json(req): Json<UpdateStepsRequest>,
) -> ApiResult<Json<TestCaseResponse>> {
    let steps = state.engine.update_steps(&test_case_id, &req.steps)?;
    let test_case = state.engine.get_test_case(&test_case_id)?;
    Ok(Json(TestCaseResponse { test_case, steps }))
}

async fn delete_test_case_handler(
    State(state): State<SharedState>,
    Path(test_case_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_test_case(&test_case_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_history_handler(
    State(state): State<SharedState>,
    Path(test_case_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.history(&test_case_id)?))
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    test_case_id: String,
    #[serde(default)]
    browser: Option<String>,
    #[serde(default)]
    continue_on_failure: Option<bool>,
    #[serde(default)]
    step_timeout_secs: Option<u64>,
}

async fn start_run_handler(
    State(state): State<SharedState>,
    Json(req): Json<StartRunRequest>,
) -> ApiResult<impl IntoResponse> {
    let browser: Browser = match &req.browser {
        Some(name) => name.parse()?,
        None => Browser::default(),
    };

    let defaults = state.engine.options();
    let options = RunOptions {
        continue_on_failure: req.continue_on_failure.unwrap_or(defaults.continue_on_failure),
        step_timeout: req
            .step_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.step_timeout),
    };

    let handle = state
        .engine
        .start_with(&req.test_case_id, browser, options)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle.run().clone())))
}

async fn active_run_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.engine.active_context())
}

async fn run_status_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.status(&run_id)?))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    outcome: CancelOutcome,
    message: &'static str,
}

async fn cancel_run_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let outcome = state.engine.cancel(&run_id);
    Json(CancelResponse {
        outcome,
        message: outcome.message(),
    })
}

async fn step_results_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.step_results(&run_id)?))
}

async fn run_report_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.report(&run_id))
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))??;
    Ok(Json(report))
}

async fn browser_status_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.engine.browsers().refresh().await)
}

async fn install_browser_handler(
    State(state): State<SharedState>,
    Path(browser): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let browser: Browser = browser.parse()?;
    let installed = state
        .engine
        .browsers()
        .ensure_installed(browser)
        .await
        .map_err(|e| EngineError::Environment(e.to_string()))?;
    Ok(Json(installed))
}

#[derive(Debug, Deserialize)]
struct ArtifactQuery {
    path: String,
    #[serde(default)]
    variant: Variant,
}

async fn artifact_handler(
    State(state): State<SharedState>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<impl IntoResponse> {
    let artifacts = state.engine.artifacts().clone();
    let data_url = tokio::task::spawn_blocking(move || {
        artifacts.read_as_data_url(&query.path, query.variant)
    })
    .await
    .map_err(|e| EngineError::Internal(e.to_string()))?
    .map_err(EngineError::from)?;
    Ok(Json(serde_json::json!({ "data_url": data_url })))
}

/// Frame sent on the event stream
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum StreamEvent {
    Run(RunEvent),
    Install(InstallEvent),
}

async fn events_handler(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(socket: WebSocket, state: SharedState) {
    let mut runs = state.engine.subscribe();
    let mut installs = state.engine.browsers().subscribe();
    let (mut sink, mut incoming) = socket.split();
    debug!("Event stream opened");

    loop {
        let event = tokio::select! {
            event = runs.recv() => match event {
                Ok(event) => StreamEvent::Run(event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Event stream lagged, skipped {} run event(s)", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            event = installs.recv() => match event {
                Ok(event) => StreamEvent::Install(event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Event stream lagged, skipped {} install event(s)", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            },
        };

        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }

    debug!("Event stream closed");
}
