//! REST endpoints for admission, job callbacks and fleet inspection.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::error::{AdmissionError, StateError};
use crate::jobs::ConversionRequest;
use crate::scheduler::{ProgressReport, SchedulerState};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SchedulerState>,
    pub admission: Arc<AdmissionController>,
}

/// Build the Axum router with job and fleet routes.
pub fn api_routes(scheduler: Arc<SchedulerState>, admission: Arc<AdmissionController>) -> Router {
    let state = AppState {
        scheduler,
        admission,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/progress", post(report_progress))
        .route("/api/fleet", get(list_fleet))
        .route("/api/queues", get(queue_depths))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn admission_status(err: &AdmissionError) -> StatusCode {
    match err {
        AdmissionError::DuplicateRequest { .. } => StatusCode::CONFLICT,
        AdmissionError::QueueFull { .. } | AdmissionError::QuotaExceeded => {
            StatusCode::TOO_MANY_REQUESTS
        }
        AdmissionError::FormatNotSupported { .. } | AdmissionError::InvalidRequest(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        AdmissionError::Infra(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn state_status(err: &StateError) -> StatusCode {
    match err {
        StateError::NotFound { .. } => StatusCode::NOT_FOUND,
        StateError::InvalidTransition { .. } | StateError::StaleReport { .. } => {
            StatusCode::CONFLICT
        }
        StateError::Infra(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn state_error(err: StateError) -> Response {
    let status = state_status(&err);
    if status == StatusCode::SERVICE_UNAVAILABLE {
        warn!(error = %err, "Job operation failed");
    }
    error_response(status, err)
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid job ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "convert-fleet",
        "workers": state.scheduler.fleet().len().await,
        "queued": state.scheduler.queue_depth().await,
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<ConversionRequest>,
) -> Response {
    match state.admission.accept(request).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": job.id,
                "status": job.status,
                "priority": job.priority,
            })),
        )
            .into_response(),
        Err(e) => {
            debug!(error = %e, "Admission rejected");
            error_response(admission_status(&e), e)
        }
    }
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.jobs().list().await)
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.scheduler.jobs().get(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => state_error(e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.scheduler.cancel(id).await {
        Ok(job) => Json(json!({ "job_id": job.id, "status": job.status })).into_response(),
        Err(e) => state_error(e),
    }
}

async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<ProgressReport>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.scheduler.report(id, report).await {
        Ok(job) => Json(json!({
            "job_id": job.id,
            "status": job.status,
            "progress": job.progress,
        }))
        .into_response(),
        Err(e) => state_error(e),
    }
}

// ── Fleet ───────────────────────────────────────────────────────────────

async fn list_fleet(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.fleet().snapshot().await)
}

async fn queue_depths(State(state): State<AppState>) -> impl IntoResponse {
    let depths = state.scheduler.depths().await;
    Json(json!({
        "vip": depths.vip,
        "normal": depths.normal,
        "total": depths.total(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::AdmissionConfig;
    use crate::error::InfraError;
    use crate::lock::StoreLock;
    use crate::quota::StoreQuotaLedger;
    use crate::scheduler::testing::scheduler;

    async fn app() -> Router {
        let t = scheduler().await;
        let admission = Arc::new(AdmissionController::new(
            t.state.clone(),
            Arc::new(StoreLock::new(t.store.clone())),
            Arc::new(StoreQuotaLedger::new(t.store.clone())),
            t.notifier.clone(),
            AdmissionConfig::default(),
        ));
        api_routes(t.state, admission)
    }

    #[tokio::test]
    async fn read_routes_exist() {
        let app = app().await;
        for uri in ["/health", "/api/jobs", "/api/fleet", "/api/queues"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"owner":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[test]
    fn admission_errors_map_to_http_status() {
        let cases = [
            (
                AdmissionError::DuplicateRequest {
                    fingerprint: "f".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                AdmissionError::QueueFull {
                    depth: 1000,
                    limit: 1000,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (AdmissionError::QuotaExceeded, StatusCode::TOO_MANY_REQUESTS),
            (
                AdmissionError::FormatNotSupported {
                    format: "stl".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AdmissionError::InvalidRequest("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AdmissionError::Infra(InfraError::LockUnavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(admission_status(&err), status, "{err}");
        }
    }

    #[test]
    fn state_errors_map_to_http_status() {
        let id = Uuid::new_v4();
        assert_eq!(
            state_status(&StateError::NotFound { id }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            state_status(&StateError::InvalidTransition {
                id,
                from: crate::jobs::JobStatus::Canceled,
                to: crate::jobs::JobStatus::Start,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            state_status(&StateError::StaleReport {
                id,
                worker: Uuid::new_v4(),
            }),
            StatusCode::CONFLICT
        );
    }
}
