use axum::{
    Json, Router,
    extract::{FromRef, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::error::SandboxError;
use crate::handlers::metrics::metrics_endpoint;
use crate::sandbox::SandboxState;
use crate::types::{
    CallRequest, CallResult, InitOp, InitRequest, InteractJudgeRequest, InteractReport,
    JudgeRequest, RunReport,
};

impl FromRef<SandboxState> for PrometheusHandle {
    fn from_ref(state: &SandboxState) -> Self {
        state.prometheus_handle.clone()
    }
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let status = match &self {
            SandboxError::InvalidRequest(_) | SandboxError::CommandRejected(_) => {
                StatusCode::BAD_REQUEST
            }
            SandboxError::CommandFailed(_) | SandboxError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::warn!("sandbox request failed: {}", self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn record_run(report: &RunReport) {
    counter!("sandbox_runs_total", "outcome" => report.result.as_str()).increment(1);
    histogram!("sandbox_run_time_ms").record(report.cpu_time_ms as f64);
    histogram!("sandbox_run_memory_kb").record((report.memory_bytes / 1024) as f64);
}

/// Binds or checks the shared token. Replies `"OK"` on success.
async fn init(State(state): State<SandboxState>, Json(req): Json<InitRequest>) -> Json<String> {
    counter!("sandbox_requests_total", "op" => "init").increment(1);
    let ok = match req.op {
        InitOp::Init => state.bind_token(&req.token),
        InitOp::Check => state.current_token().as_deref() == Some(req.token.as_str()),
    };
    if ok {
        tracing::info!(op = ?req.op, "token accepted");
        Json("OK".to_string())
    } else {
        tracing::warn!(op = ?req.op, "token refused");
        Json("token mismatch".to_string())
    }
}

async fn call(
    State(state): State<SandboxState>,
    Json(req): Json<CallRequest>,
) -> Result<Json<CallResult>, SandboxError> {
    counter!("sandbox_requests_total", "op" => "call").increment(1);
    Ok(Json(state.executor.call(req).await?))
}

async fn judge(
    State(state): State<SandboxState>,
    Json(req): Json<JudgeRequest>,
) -> Result<Json<RunReport>, SandboxError> {
    counter!("sandbox_requests_total", "op" => "judge").increment(1);
    state.executor.run_commands(&req.cmds).await?;
    let executor = state.executor.clone();
    let report = tokio::task::spawn_blocking(move || executor.judge(&req))
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::other(e)))?;
    record_run(&report);
    Ok(Json(report))
}

async fn interact_judge(
    State(state): State<SandboxState>,
    Json(req): Json<InteractJudgeRequest>,
) -> Result<Json<InteractReport>, SandboxError> {
    counter!("sandbox_requests_total", "op" => "interact_judge").increment(1);
    state.executor.run_commands(&req.cmds).await?;
    let executor = state.executor.clone();
    let report = tokio::task::spawn_blocking(move || executor.interact_judge(&req))
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::other(e)))?;
    record_run(&report.result);
    Ok(Json(report))
}

/// Rejects requests whose `token` header is not the bound token.
async fn require_token(State(state): State<SandboxState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get("token")
        .and_then(|v| v.to_str().ok());
    match (state.current_token(), presented) {
        (Some(bound), Some(presented)) if bound == presented => next.run(request).await,
        _ => {
            counter!("sandbox_requests_total", "op" => "unauthorized").increment(1);
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid token" })),
            )
                .into_response()
        }
    }
}

pub fn router(state: SandboxState) -> Router {
    let guarded = Router::new()
        .route("/call", post(call))
        .route("/judge", post(judge))
        .route("/interact_judge", post(interact_judge))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/init", post(init))
        .route("/metrics", get(metrics_endpoint))
        .merge(guarded)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}
