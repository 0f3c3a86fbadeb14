use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PersistenceError;

/// Written into `error_message` when the ingestion publish step fails.
pub const QUEUE_FAILURE_MESSAGE: &str = "Failed to queue job for processing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Legal edges of the job lifecycle.
    ///
    /// `processing -> processing` is allowed so a redelivered message can
    /// re-enter a job whose previous consumer died before acknowledging.
    /// Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    /// Every state from which `self` may be entered.
    pub fn predecessors(&self) -> Vec<JobStatus> {
        [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(*self))
        .collect()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogoDetection {
    pub bounding_box: BoundingBox,
    pub confidence: f64,
    pub logo_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub source_key: String,
    pub upload_url: String,

    pub result_url: Option<String>,
    pub logos: Vec<LogoDetection>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Raw `jobs` row as Postgres returns it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub status: String,
    pub s3_key: String,
    pub upload_url: String,
    pub result_url: Option<String>,
    pub logos_found: Option<i32>,
    pub logos_json: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = PersistenceError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            PersistenceError::Corrupt(format!("job {} has unknown status {:?}", row.id, row.status))
        })?;

        let logos = match row.logos_json {
            Some(v) => serde_json::from_value(v).map_err(|e| {
                PersistenceError::Corrupt(format!("job {} has unreadable logos: {e}", row.id))
            })?,
            None => Vec::new(),
        };

        Ok(Job {
            id: row.id,
            status,
            source_key: row.s3_key,
            upload_url: row.upload_url,
            result_url: row.result_url,
            logos,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub source_key: String,
    pub upload_url: String,
}

/// Point-in-time JSON snapshot of a job as published to the delivery channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub status: JobStatus,
    pub s3_key: String,
    pub upload_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logos_found: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for QueueMessage {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            s3_key: job.source_key.clone(),
            upload_url: job.upload_url.clone(),
            result_url: job.result_url.clone(),
            logos_found: (!job.logos.is_empty()).then(|| job.logos.len() as i32),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            error: job.error_message.clone(),
        }
    }
}
