//! REST handlers for users, segments, memberships, operation history and
//! operational endpoints.
//!
//! Store calls are blocking, so every handler hops onto the blocking pool
//! through [`run_blocking`].

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use segments_core::types::{AddSegment, SegmentInfo, UserId, YearMonth};
use segments_core::{SegmentError, SegmentResult};
use segments_membership::history::report_file_name;
use segments_membership::{
    AutoSegmentSummary, CohortAssigner, ExpirationSweeper, MembershipEngine, MutationSummary,
    OperationHistory, Store, SweepOutcome,
};
use segments_reports::{render_csv, ReportError, ReportUploader};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MembershipEngine>,
    pub assigner: Arc<CohortAssigner>,
    pub sweeper: Arc<ExpirationSweeper>,
    pub history: Arc<OperationHistory>,
    pub reports: Arc<dyn ReportUploader>,
    pub start_time: Instant,
}

impl AppState {
    /// `sweeper` is shared with the background scheduler so manual and
    /// scheduled passes exclude each other.
    pub fn new(
        store: Arc<Store>,
        sweeper: Arc<ExpirationSweeper>,
        reports: Arc<dyn ReportUploader>,
    ) -> Self {
        Self {
            engine: Arc::new(MembershipEngine::new(store.clone())),
            assigner: Arc::new(CohortAssigner::new(store.clone())),
            history: Arc::new(OperationHistory::new(store)),
            sweeper,
            reports,
            start_time: Instant::now(),
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    metrics::counter!("api.errors").increment(1);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Map the service error taxonomy onto HTTP statuses. Store failures are
/// logged and reported without internal detail.
fn segment_error(err: SegmentError) -> ApiError {
    match &err {
        SegmentError::NotFound { .. } => {
            api_error(StatusCode::NOT_FOUND, err.kind(), err.to_string())
        }
        SegmentError::Conflict { .. } => {
            api_error(StatusCode::CONFLICT, err.kind(), err.to_string())
        }
        SegmentError::Validation(msg) => {
            warn!(error = %msg, "Request validation failed");
            api_error(StatusCode::BAD_REQUEST, err.kind(), msg.clone())
        }
        SegmentError::Store(msg) => {
            error!(error = %msg, "Store operation failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.kind(),
                "Internal storage error",
            )
        }
    }
}

fn report_error(err: ReportError) -> ApiError {
    match err {
        ReportError::Unavailable => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "report_storage_unavailable",
            "Report storage is unavailable",
        ),
        ReportError::InvalidName(name) => api_error(
            StatusCode::BAD_REQUEST,
            "invalid_report_name",
            format!("invalid report name '{name}'"),
        ),
        ReportError::Io(e) => {
            error!(error = %e, "Report export failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "report_export_failed",
                "Report export failed",
            )
        }
    }
}

/// Run a blocking store call on the blocking pool.
async fn run_blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> SegmentResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(segment_error),
        Err(e) => {
            error!(error = %e, "Blocking task failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal processing error",
            ))
        }
    }
}

// ─── Request / response bodies ──────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MutateRequest {
    #[serde(default)]
    pub add_segments: Vec<AddSegment>,
    #[serde(default)]
    pub remove_segments: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MonthQuery {
    pub date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AutoQuery {
    pub auto: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserSegmentsResponse {
    pub user_id: UserId,
    pub segments: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserCreatedResponse {
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
pub struct SegmentCreatedResponse {
    pub segment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto: Option<AutoSegmentSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentListResponse {
    pub segments: Vec<SegmentInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportLinkResponse {
    pub link: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResponse {
    pub status: String,
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub committed_transactions: u64,
}

fn parse_month(raw: Option<&str>) -> ApiResult<Option<YearMonth>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(segment_error),
    }
}

// ─── Operational ────────────────────────────────────────────────────────────

/// GET /ping
pub async fn ping() -> &'static str {
    "pong!"
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        committed_transactions: state.engine.store().committed_transactions(),
    })
}

/// POST /v1/admin/sweep: run an expiration pass now.
pub async fn trigger_sweep(State(state): State<AppState>) -> ApiResult<Json<SweepResponse>> {
    let sweeper = state.sweeper.clone();
    let outcome = run_blocking(move || sweeper.try_sweep()).await?;
    let response = match outcome {
        SweepOutcome::Completed(removed) => SweepResponse {
            status: "completed".to_string(),
            removed,
        },
        SweepOutcome::Skipped => SweepResponse {
            status: "skipped".to_string(),
            removed: 0,
        },
    };
    Ok(Json(response))
}

// ─── Users ──────────────────────────────────────────────────────────────────

/// POST /v1/user/:user_id
pub async fn create_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<(StatusCode, Json<UserCreatedResponse>)> {
    let engine = state.engine.clone();
    run_blocking(move || engine.create_user(user_id)).await?;
    Ok((StatusCode::CREATED, Json(UserCreatedResponse { user_id })))
}

/// DELETE /v1/user/:user_id
pub async fn delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<StatusCode> {
    let engine = state.engine.clone();
    run_blocking(move || engine.delete_user(user_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/user/:user_id/segments
pub async fn get_user_segments(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<UserSegmentsResponse>> {
    let engine = state.engine.clone();
    let segments = run_blocking(move || engine.user_segments(user_id)).await?;
    Ok(Json(UserSegmentsResponse { user_id, segments }))
}

/// POST /v1/user/:user_id/segments
pub async fn mutate_user_segments(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(request): Json<MutateRequest>,
) -> ApiResult<Json<MutationSummary>> {
    let engine = state.engine.clone();
    let summary = run_blocking(move || {
        engine.mutate(user_id, &request.add_segments, &request.remove_segments)
    })
    .await?;
    Ok(Json(summary))
}

/// GET /v1/user/:user_id/operations?date=YYYY-MM
pub async fn get_user_operations(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<impl IntoResponse> {
    let month = parse_month(query.date.as_deref())?;
    let history = state.history.clone();
    let lines = run_blocking(move || history.user_operation_lines(user_id, month)).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        render_csv(&lines),
    ))
}

/// GET /v1/user/:user_id/operations/report-link?date=YYYY-MM
pub async fn get_report_link(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<Json<ReportLinkResponse>> {
    if !state.reports.is_available() {
        return Err(report_error(ReportError::Unavailable));
    }
    let month = parse_month(query.date.as_deref())?;
    let history = state.history.clone();
    let lines = run_blocking(move || history.user_operation_lines(user_id, month)).await?;

    let reports = state.reports.clone();
    let file_name = report_file_name(user_id, month);
    let link = tokio::task::spawn_blocking(move || reports.upload_and_link(&file_name, &lines))
        .await
        .map_err(|e| {
            error!(error = %e, "Report upload task failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal processing error",
            )
        })?
        .map_err(report_error)?;

    info!(user_id, link = %link, "Report link issued");
    Ok(Json(ReportLinkResponse { link }))
}

// ─── Segments ───────────────────────────────────────────────────────────────

/// POST /v1/segment/:name?auto=<percentage>
pub async fn create_segment(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<AutoQuery>,
) -> ApiResult<(StatusCode, Json<SegmentCreatedResponse>)> {
    let response = match query.auto {
        Some(percentage) => {
            let assigner = state.assigner.clone();
            let segment = name.clone();
            let summary =
                run_blocking(move || assigner.create_auto_segment(&segment, percentage)).await?;
            SegmentCreatedResponse {
                segment: name,
                auto: Some(summary),
            }
        }
        None => {
            let engine = state.engine.clone();
            let segment = name.clone();
            run_blocking(move || engine.create_segment(&segment)).await?;
            SegmentCreatedResponse {
                segment: name,
                auto: None,
            }
        }
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// DELETE /v1/segment/:name
pub async fn delete_segment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let engine = state.engine.clone();
    run_blocking(move || engine.delete_segment(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/segment/list
pub async fn list_segments(State(state): State<AppState>) -> ApiResult<Json<SegmentListResponse>> {
    let engine = state.engine.clone();
    let segments = run_blocking(move || engine.list_segments()).await?;
    Ok(Json(SegmentListResponse { segments }))
}
