//! JSON HTTP interface over the job queue and dossier store.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dossier_core::{AskWhySection, ScrapeTarget, TriggerType};
use dossier_storage::{DossierStore, DossierStoreError, JobQueue, QueueError};
use dossier_sync::{ask_why, catalog, AskWhyError, Backends};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dossier-web";

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub dossiers: Arc<dyn DossierStore>,
}

impl AppState {
    pub fn new(queue: Arc<dyn JobQueue>, dossiers: Arc<dyn DossierStore>) -> Self {
        Self { queue, dossiers }
    }
}

impl From<Backends> for AppState {
    fn from(backends: Backends) -> Self {
        Self::new(backends.queue, backends.dossiers)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub user_id: String,
    pub targets: Vec<ScrapeTarget>,
    /// Manual triggers from the dashboard default to `admin`.
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/jobs", post(enqueue_handler))
        .route("/jobs/{id}", get(job_handler))
        .route("/jobs/{id}/cancel", post(cancel_handler))
        .route("/dossiers/{id}", get(dossier_handler))
        .route("/users/{user_id}/dossiers", get(user_dossiers_handler))
        .route(
            "/dossiers/{id}/ask-why/{section}/{question_id}",
            get(ask_why_handler),
        )
        .route("/ask-why/catalog", get(catalog_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http interface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> Response {
    let trigger_type = request.trigger_type.unwrap_or(TriggerType::Admin);
    match state
        .queue
        .enqueue(&request.user_id, request.targets, trigger_type)
        .await
    {
        Ok(job_id) => (StatusCode::CREATED, Json(EnqueueResponse { job_id })).into_response(),
        Err(QueueError::DuplicateScheduled { existing }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "a scheduled job already exists for this period",
                "existing_job_id": existing,
            })),
        )
            .into_response(),
        Err(err) => queue_error(err),
    }
}

async fn job_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.queue.get(id).await {
        Ok(Some(job)) => Json(job.status_view()).into_response(),
        Ok(None) => queue_error(QueueError::NotFound(id)),
        Err(err) => queue_error(err),
    }
}

async fn cancel_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.queue.cancel(id).await {
        Ok(()) => Json(json!({ "job_id": id, "status": "canceled" })).into_response(),
        Err(err) => queue_error(err),
    }
}

async fn dossier_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.dossiers.get(id).await {
        Ok(Some(dossier)) => Json(dossier).into_response(),
        Ok(None) => store_error(DossierStoreError::NotFound(id)),
        Err(err) => store_error(err),
    }
}

async fn user_dossiers_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    match state.dossiers.list_for_user(&user_id).await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(err) => store_error(err),
    }
}

async fn ask_why_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, section, question_id)): AxumPath<(Uuid, String, String)>,
) -> Response {
    let Ok(parsed) = section.parse::<AskWhySection>() else {
        return ask_why_error(AskWhyError::NotFound {
            section,
            question_id,
        });
    };
    match ask_why(state.dossiers.as_ref(), id, parsed, &question_id).await {
        Ok(answer) => Json(answer).into_response(),
        Err(err) => ask_why_error(err),
    }
}

async fn catalog_handler() -> Response {
    Json(catalog()).into_response()
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn queue_error(err: QueueError) -> Response {
    let status = match &err {
        QueueError::InvalidTargets(_) => StatusCode::BAD_REQUEST,
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::DuplicateScheduled { .. }
        | QueueError::Transition(_)
        | QueueError::Canceled(_)
        | QueueError::LeaseLost { .. } => StatusCode::CONFLICT,
        QueueError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "job queue request failed");
    }
    error_response(status, err)
}

fn store_error(err: DossierStoreError) -> Response {
    match err {
        DossierStoreError::NotFound(_) => error_response(StatusCode::NOT_FOUND, err),
        DossierStoreError::DuplicateForJob { .. } => error_response(StatusCode::CONFLICT, err),
        DossierStoreError::Storage(_) => {
            error!(error = %err, "dossier store request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

fn ask_why_error(err: AskWhyError) -> Response {
    match err {
        AskWhyError::NotFound { .. } | AskWhyError::DossierNotFound(_) => {
            error_response(StatusCode::NOT_FOUND, err)
        }
        AskWhyError::Store(inner) => store_error(inner),
    }
}
