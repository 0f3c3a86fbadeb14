// crates/logoflow/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus, LogoDetection};

pub const UPLOAD_ACCEPTED_MESSAGE: &str = "Image uploaded successfully. Processing started.";
pub const SERVICE_NAME: &str = "logo-preserve-backend";

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub upload_url: String,
}

#[derive(Debug, Deserialize)]
pub struct PresignedUrlRequest {
    #[serde(default)]
    pub file_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresignedUrlResponse {
    pub success: bool,
    pub presigned_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            message: message.into(),
        }
    }
}

/// Public view of a ledger row.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub s3_key: String,
    pub upload_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    pub logos_found: usize,
    #[serde(default)]
    pub logos: Vec<LogoDetection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            s3_key: job.source_key,
            upload_url: job.upload_url,
            result_url: job.result_url,
            logos_found: job.logos.len(),
            logos: job.logos,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            error: job.error_message,
        }
    }
}
