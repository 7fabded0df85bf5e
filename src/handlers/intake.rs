use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::error::{StoreError, SubmitError};
use crate::handlers::metrics::metrics_endpoint;
use crate::submit::{Intake, SubmitRequest};

#[derive(Clone)]
pub struct IntakeState {
    pub intake: Intake,
    pub prometheus_handle: PrometheusHandle,
}

impl FromRef<IntakeState> for PrometheusHandle {
    fn from_ref(state: &IntakeState) -> Self {
        state.prometheus_handle.clone()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Failure of an intake endpoint, rendered as a JSON error body.
#[derive(Debug)]
pub enum ApiError {
    Submit(SubmitError),
    Store(StoreError),
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        ApiError::Submit(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Submit(SubmitError::TooManyPending) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Submit(
                SubmitError::UnknownProblem(_)
                | SubmitError::UnknownLanguage(_)
                | SubmitError::UnknownContest(_),
            )
            | ApiError::Store(StoreError::NotFound { .. }) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Submit(
                SubmitError::TooLarge(_)
                | SubmitError::LanguageNotAllowed(_)
                | SubmitError::ForeignPeriod(_),
            ) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::Submit(SubmitError::Store(_)) | ApiError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let message = match self {
            ApiError::Submit(e) => e.to_string(),
            ApiError::Store(e) => e.to_string(),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("intake failed: {}", message);
        }
        (status, Json(ErrorBody { code, message })).into_response()
    }
}

/// Intake touches the store, so it runs on the blocking pool.
async fn on_intake<T, E, F>(state: &IntakeState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    E: Send + 'static,
    ApiError: From<E>,
    F: FnOnce(&Intake) -> Result<T, E> + Send + 'static,
{
    let intake = state.intake.clone();
    let joined = tokio::task::spawn_blocking(move || op(&intake)).await;
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(ApiError::Store(StoreError::Task(e.to_string()))),
    }
}

#[derive(Serialize)]
struct SubmitResponse {
    id: u64,
    queue_position: u64,
}

#[derive(Serialize)]
struct QueuePosition {
    id: u64,
    queue_position: u64,
}

async fn submit(
    State(state): State<IntakeState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let submission = on_intake(&state, move |intake| intake.submit(req)).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id: submission.id,
            queue_position: submission.queue_position,
        }),
    ))
}

async fn enqueue(
    State(state): State<IntakeState>,
    Path(id): Path<u64>,
) -> Result<Json<QueuePosition>, ApiError> {
    let queue_position = on_intake(&state, move |intake| intake.enqueue(id)).await?;
    Ok(Json(QueuePosition { id, queue_position }))
}

async fn queue_position(
    State(state): State<IntakeState>,
    Path(id): Path<u64>,
) -> Result<Json<QueuePosition>, ApiError> {
    let queue_position = on_intake(&state, move |intake| intake.queue_position(id)).await?;
    Ok(Json(QueuePosition { id, queue_position }))
}

pub fn router(state: IntakeState) -> Router {
    Router::new()
        .route("/submissions", post(submit))
        .route("/submissions/{id}/enqueue", post(enqueue))
        .route("/submissions/{id}/queue_position", get(queue_position))
        .route("/metrics", get(metrics_endpoint))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}
