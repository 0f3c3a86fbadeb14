use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::api::models::{
    ErrorBody, HealthResponse, JobView, PresignedUrlRequest, PresignedUrlResponse,
    UploadResponse, SERVICE_NAME, UPLOAD_ACCEPTED_MESSAGE,
};
use crate::error::{bounded, PipelineError, ValidationError};
use crate::jobs::ingest::{IngestCoordinator, IngestRequest};
use crate::jobs::repo::JobLedger;

pub mod models;

/// Multipart framing allowance on top of the largest accepted file.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Form field carrying the uploaded image.
pub const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: IngestCoordinator,
    pub allowed_origins: Vec<String>,
}

/// Browser access policy. Credentials are only allowed with an explicit
/// origin list.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ])
        .expose_headers([header::CONTENT_LENGTH])
        .max_age(Duration::from_secs(12 * 60 * 60));

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

pub fn router(state: AppState) -> Router {
    let body_limit = (state.coordinator.policy().max_file_size + MULTIPART_OVERHEAD) as usize;
    let cors = cors_layer(&state.allowed_origins);

    let upload = Router::new()
        .route("/upload", post(upload_image))
        .route("/upload/presigned-url", post(presigned_url));

    Router::new()
        .route("/health", get(health))
        .merge(upload.clone())
        .nest("/api/v1", upload.route("/jobs/:id", get(get_job)))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    NotFound(Uuid),
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError::Pipeline(e)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Pipeline(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Pipeline(PipelineError::Validation(e)) => (
                StatusCode::BAD_REQUEST,
                ErrorBody::new("VALIDATION_ERROR", e.to_string()),
            ),
            ApiError::Pipeline(e) => {
                error!(error = %e, code = e.code(), "request failed");
                let message = match &e {
                    PipelineError::Storage(_) => "Failed to upload file",
                    PipelineError::Persistence(_) => "Failed to create job",
                    PipelineError::Delivery(_) => "Failed to queue job",
                    PipelineError::Processing(_) | PipelineError::Validation(_) => {
                        "Internal server error"
                    }
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new(e.code(), message),
                )
            }
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorBody::new("NOT_FOUND", format!("job {id} not found")),
            ),
            ApiError::Internal(detail) => {
                error!(%detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new("INTERNAL_ERROR", "Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now(),
            service: SERVICE_NAME.to_string(),
        }),
    )
}

#[instrument(skip(state, multipart))]
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut request: Option<IngestRequest> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ValidationError::Malformed(e.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let body = field
            .bytes()
            .await
            .map_err(|e| ValidationError::Malformed(e.body_text()))?;

        request = Some(IngestRequest {
            file_name,
            content_type,
            body: body.to_vec(),
        });
        break;
    }

    let request = request.ok_or(ValidationError::MissingFile)?;

    // The saga runs on its own task so a dropped connection cannot stop it
    // between a failed publish and its compensation.
    let coordinator = state.coordinator.clone();
    let receipt = tokio::spawn(async move { coordinator.ingest(request).await })
        .await
        .map_err(|e| ApiError::Internal(format!("ingest task aborted: {e}")))??;

    info!(job_id = %receipt.job_id, "upload accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            success: true,
            job_id: receipt.job_id,
            status: receipt.status,
            message: UPLOAD_ACCEPTED_MESSAGE.to_string(),
            upload_url: receipt.upload_url,
        }),
    )
        .into_response())
}

pub async fn presigned_url(
    State(state): State<AppState>,
    body: Result<Json<PresignedUrlRequest>, JsonRejection>,
) -> Result<Json<PresignedUrlResponse>, ApiError> {
    let Json(body) = body.map_err(|e| {
        warn!(error = %e, "unreadable presigned url request");
        ValidationError::InvalidRequest
    })?;

    let presigned_url = state
        .coordinator
        .presigned_upload_url(&body.file_name)
        .await?;

    Ok(Json(PresignedUrlResponse {
        success: true,
        presigned_url,
    }))
}

pub async fn get_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<JobView>, ApiError> {
    let Path(id) = id.map_err(|e| {
        warn!(error = %e, "unreadable job id");
        ValidationError::InvalidJobId
    })?;

    let timeout = state.coordinator.policy().timeouts.ledger;
    let job = bounded(timeout, state.coordinator.ledger().get_job(id))
        .await
        .map_err(PipelineError::from)?;

    match job {
        Some(job) => Ok(Json(JobView::from(job))),
        None => Err(ApiError::NotFound(id)),
    }
}
