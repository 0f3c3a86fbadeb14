use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{default_allowed_types, StepTimeouts, DEFAULT_MAX_FILE_SIZE};
use crate::error::{bounded, PipelineError, ValidationError};
use crate::jobs::model::{JobStatus, NewJob, QueueMessage, QUEUE_FAILURE_MESSAGE};
use crate::jobs::repo::{JobLedger, Transition};
use crate::queue::DeliveryChannel;
use crate::storage::{storage_key, BlobStore};

/// Immutable ingestion limits, built once at startup.
#[derive(Debug, Clone)]
pub struct IngestPolicy {
    pub allowed_types: Vec<String>,
    pub max_file_size: u64,
    pub get_url_ttl: Duration,
    pub put_url_ttl: Duration,
    pub timeouts: StepTimeouts,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            allowed_types: default_allowed_types(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            get_url_ttl: Duration::from_secs(24 * 60 * 60),
            put_url_ttl: Duration::from_secs(60 * 60),
            timeouts: StepTimeouts::default(),
        }
    }
}

impl IngestPolicy {
    pub fn validate(&self, content_type: &str, size: u64) -> Result<(), ValidationError> {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();

        if !self.allowed_types.iter().any(|t| *t == ct) {
            return Err(ValidationError::UnsupportedContentType(
                content_type.to_string(),
                self.allowed_types.join(", "),
            ));
        }
        if size > self.max_file_size {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        if size == 0 {
            return Err(ValidationError::Empty);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub file_name: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl IngestRequest {
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub upload_url: String,
}

/// Turns one upload into a stored blob, a pending ledger row and a published
/// message, in that order. Only the publish step is compensated.
#[derive(Clone)]
pub struct IngestCoordinator {
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<dyn JobLedger>,
    channel: Arc<dyn DeliveryChannel>,
    policy: IngestPolicy,
}

impl IngestCoordinator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<dyn JobLedger>,
        channel: Arc<dyn DeliveryChannel>,
        policy: IngestPolicy,
    ) -> Self {
        Self {
            blobs,
            ledger,
            channel,
            policy,
        }
    }

    pub fn policy(&self) -> &IngestPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    #[instrument(skip(self, req), fields(file_name = %req.file_name, size = req.size(), job_id = tracing::field::Empty))]
    pub async fn ingest(&self, req: IngestRequest) -> Result<IngestReceipt, PipelineError> {
        let size = req.size();
        self.policy.validate(&req.content_type, size)?;

        let t = &self.policy.timeouts;

        // 1) identity
        let job_id = Uuid::new_v4();
        tracing::Span::current().record("job_id", tracing::field::display(job_id));

        // 2) key
        let key = storage_key(job_id, &req.file_name);

        // 3) blob write
        bounded(t.blob, self.blobs.put(&key, req.body, size, &req.content_type))
            .await
            .inspect_err(|e| error!(%job_id, %key, error = %e, "blob upload failed"))?;

        // 4) signed retrieval URL; the blob stays orphaned on failure
        let upload_url = bounded(t.blob, self.blobs.signed_get_url(&key, self.policy.get_url_ttl))
            .await
            .inspect_err(|e| error!(%job_id, %key, error = %e, "signing retrieval url failed"))?;

        // 5) ledger row
        let job = bounded(
            t.ledger,
            self.ledger.create_job(NewJob {
                id: job_id,
                status: JobStatus::Pending,
                source_key: key.clone(),
                upload_url: upload_url.clone(),
            }),
        )
        .await
        .inspect_err(|e| error!(%job_id, %key, error = %e, "ledger insert failed; blob orphaned"))?;

        // 6) publish, compensating the ledger row on failure
        let message = QueueMessage::from(&job);
        if let Err(publish_err) = bounded(t.publish, self.channel.publish(&message)).await {
            error!(%job_id, error = %publish_err, "publish failed; compensating");
            self.compensate(job_id).await;
            return Err(publish_err.into());
        }

        info!(%job_id, %key, "job queued");

        Ok(IngestReceipt {
            job_id,
            status: job.status,
            upload_url,
        })
    }

    async fn compensate(&self, job_id: Uuid) {
        let res = bounded(
            self.policy.timeouts.ledger,
            self.ledger.compensate_pending(job_id, QUEUE_FAILURE_MESSAGE),
        )
        .await;

        match res {
            Ok(Transition::Applied(_)) => {
                info!(%job_id, "job marked failed after publish failure");
            }
            // the broker took the message after all and a consumer claimed it
            Ok(Transition::Rejected {
                current: Some(current @ (JobStatus::Processing | JobStatus::Completed)),
            }) => {
                info!(%job_id, %current, "compensation skipped; consumer already owns the job");
            }
            Ok(Transition::Rejected { current }) => {
                warn!(%job_id, ?current, "compensation skipped; job already left pending");
            }
            Err(e) => {
                error!(
                    %job_id,
                    error = %e,
                    "compensation failed; ledger row left pending with no queued message"
                );
            }
        }
    }

    /// Signed URL a client can PUT an object to directly, under a fresh
    /// `original/<uuid>/` prefix. No ledger row is created.
    #[instrument(skip(self))]
    pub async fn presigned_upload_url(&self, file_name: &str) -> Result<String, PipelineError> {
        if file_name.trim().is_empty() {
            return Err(ValidationError::MissingFileName.into());
        }

        let key = storage_key(Uuid::new_v4(), file_name);
        let url = bounded(
            self.policy.timeouts.blob,
            self.blobs.signed_put_url(&key, self.policy.put_url_ttl),
        )
        .await?;

        Ok(url)
    }
}
