//! Ops endpoints: health, queue depth and a manual cycle trigger.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use crate::error::PipelineError;
use crate::pipeline::PipelineOrchestrator;
use crate::scheduler::{CycleScheduler, HealthStatus};

/// Shared state for ops routes.
#[derive(Clone)]
pub struct OpsState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub scheduler: Arc<CycleScheduler>,
}

/// GET /health
///
/// Always returns the report; the status code is 503 only when unhealthy.
async fn get_health(State(state): State<OpsState>) -> impl IntoResponse {
    let report = state.scheduler.get_health().await;
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (code, Json(report))
}

/// GET /queue
async fn get_queue(State(state): State<OpsState>) -> impl IntoResponse {
    match state.orchestrator.get_queue_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// POST /cycle
///
/// Runs one cycle inline. 409 if a cycle is already running.
async fn run_cycle(State(state): State<OpsState>) -> impl IntoResponse {
    match state.scheduler.run_cycle().await {
        Ok(report) => Json(report).into_response(),
        Err(e @ PipelineError::Validation(_)) => error_response(StatusCode::CONFLICT, &e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

fn error_response(code: StatusCode, err: &PipelineError) -> axum::response::Response {
    warn!(error = %err, status = %code, "Ops request failed");
    (
        code,
        Json(serde_json::json!({"error": err.to_string(), "kind": err.kind()})),
    )
        .into_response()
}

/// Build the ops routes.
pub fn ops_routes(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/queue", get(get_queue))
        .route("/cycle", post(run_cycle))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::store::memory::InMemoryJobLog;
    use crate::test_support::{Fixture, StubMail, profile};

    async fn state(users: Vec<crate::store::traits::UserProfile>) -> OpsState {
        let fx = Fixture::new(users, StubMail::default()).await;
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            fx.collaborators.clone(),
            fx.guards.clone(),
            fx.config.clone(),
        ));
        let scheduler = Arc::new(CycleScheduler::new(
            orchestrator.clone(),
            fx.collaborators.users.clone(),
            Arc::new(InMemoryJobLog::new()),
            SchedulerConfig::default(),
        ));
        OpsState {
            orchestrator,
            scheduler,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok_before_first_cycle() {
        let app = ops_routes(state(vec![]).await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["scheduler"], "idle");
        assert_eq!(json["database"]["ok"], true);
    }

    #[tokio::test]
    async fn queue_reports_depth() {
        let app = ops_routes(state(vec![]).await);
        let response = app
            .oneshot(Request::get("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["health"], "healthy");
        assert_eq!(json["pending"], 0);
    }

    #[tokio::test]
    async fn manual_cycle_returns_report() {
        let app = ops_routes(state(vec![profile("u1", 5)]).await);
        let response = app
            .oneshot(Request::post("/cycle").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["users_found"], 1);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = ops_routes(state(vec![]).await);
        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
