use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::JobError;
use crate::jobs::{JobManager, JobStatus};
use crate::plan::ExecutionPlan;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: JobManager,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UploadDocumentRequest {
    pub title: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    /// Parsed by the handler so malformed plans are reported as 400
    pub plan: serde_json::Value,
    #[serde(default)]
    pub document_ids: Vec<String>,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: JobStatus,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(_) => ApiError::BadRequest(err.to_string()),
            JobError::JobNotFound(_) | JobError::DocumentNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            JobError::DocumentInUse { .. } | JobError::InvalidTransition { .. } => {
                ApiError::Conflict(err.to_string())
            }
            JobError::Store(ref e) => {
                error!(error = %e, "Job store failure");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/documents", get(list_documents).post(upload_document))
        .route(
            "/api/documents/{id}",
            get(get_document).delete(delete_document),
        )
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/{id}", get(job_status))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/results", get(job_results))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_documents(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.list_documents().await?))
}

async fn upload_document(
    State(state): State<SharedState>,
    Json(req): Json<UploadDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Document title must not be empty".into()));
    }
    let document = state
        .manager
        .upload_document(&req.title, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(document.summary())))
}

async fn get_document(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.get_document(&id).await?))
}

async fn delete_document(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.delete_document(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_jobs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.list_jobs().await?))
}

async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let plan: ExecutionPlan = serde_json::from_value(req.plan)
        .map_err(|e| ApiError::BadRequest(format!("Invalid plan: {}", e)))?;
    let job_id = state
        .manager
        .submit(plan, req.document_ids, req.fail_fast)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(JobAccepted {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

async fn job_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.status(&id).await?))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.manager.cancel(&id).await?;
    Ok(Json(JobAccepted { job_id: id, status }))
}

async fn job_results(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.results(&id).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionCaller, ModelSelector, ScriptedClient};
    use crate::jobs::{JobRecord, ManagerConfig, SqliteJobStore};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_manager() -> JobManager {
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let caller = Arc::new(CompletionCaller::new(
            Arc::new(ScriptedClient::new()),
            ModelSelector::new("test-model"),
        ));
        JobManager::new(store, caller, ManagerConfig::default())
    }

    fn test_app(manager: JobManager) -> Router {
        api_router().with_state(Arc::new(AppState { manager }))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn plan_json() -> serde_json::Value {
        serde_json::json!({
            "name": "api-plan",
            "operations": {
                "summarize": {"prompt": "Summarize the documents."}
            },
            "phases": [
                {"id": 1, "operation": "summarize"},
                {"id": "1.5", "operation": "summarize"},
                {"id": 2, "operation": "summarize", "depends_on": [1, 1.5]}
            ]
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app(test_manager())
            .oneshot(empty_request("GET", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let app = test_app(test_manager());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/documents",
                serde_json::json!({"title": "Report", "content": "Body text"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: serde_json::Value = body_json(response.into_body()).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["title"], "Report");

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/documents/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let document: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(document["content"], "Body text");

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/documents"))
            .await
            .unwrap();
        let listed: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(listed.len(), 1);

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/api/documents/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", &format!("/api/documents/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_and_poll_job() {
        let manager = test_manager();
        let app = test_app(manager.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/jobs",
                serde_json::json!({"plan": plan_json()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let accepted: JobAccepted = body_json(response.into_body()).await;

        assert_eq!(manager.wait(&accepted.job_id).await.unwrap(), JobStatus::Completed);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/jobs/{}", accepted.job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["phases"].as_array().unwrap().len(), 3);

        let response = app
            .clone()
            .oneshot(empty_request(
                "GET",
                &format!("/api/jobs/{}/results", accepted.job_id),
            ))
            .await
            .unwrap();
        let results: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[1]["phase"], 1.5);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/jobs"))
            .await
            .unwrap();
        let jobs: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["plan_name"], "api-plan");

        // Terminal jobs cannot be cancelled
        let response = app
            .oneshot(empty_request(
                "POST",
                &format!("/api/jobs/{}/cancel", accepted.job_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_plans_are_bad_requests() {
        let app = test_app(test_manager());

        let cyclic = serde_json::json!({
            "operations": {"op": {"prompt": "p"}},
            "phases": [
                {"id": 1, "operation": "op", "depends_on": [2]},
                {"id": 2, "operation": "op", "depends_on": [1]}
            ]
        });
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/jobs", serde_json::json!({"plan": cyclic})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("Cycle"));

        let malformed = serde_json::json!({"phases": "not a list"});
        let response = app
            .oneshot(json_request("POST", "/api/jobs", serde_json::json!({"plan": malformed})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let app = test_app(test_manager());

        for (method, uri) in [
            ("GET", "/api/jobs/missing"),
            ("GET", "/api/jobs/missing/results"),
            ("POST", "/api/jobs/missing/cancel"),
            ("DELETE", "/api/documents/missing"),
        ] {
            let response = app.clone().oneshot(empty_request(method, uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{} {}", method, uri);
        }

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/jobs",
                serde_json::json!({"plan": plan_json(), "document_ids": ["missing"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deleting_document_in_use_conflicts() {
        let manager = test_manager();
        let document = manager.upload_document("Doc", "text").await.unwrap();
        let plan: ExecutionPlan = serde_json::from_value(plan_json()).unwrap();
        let job = JobRecord::new(plan, vec![document.id.clone()], false);
        manager.store().create_job(&job).await.unwrap();

        let response = test_app(manager)
            .oneshot(empty_request(
                "DELETE",
                &format!("/api/documents/{}", document.id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
