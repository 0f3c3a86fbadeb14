use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::detector::{DetectionRequest, Detector};
use crate::error::bounded;
use crate::jobs::model::{JobStatus, LogoDetection, QueueMessage};
use crate::jobs::repo::{JobLedger, Transition};
use crate::queue::{HandlerError, MessageHandler};

/// Consumer side of the pipeline: one delivered message, one detector call,
/// one terminal ledger write.
///
/// Detector failures are terminal and end in `failed`. Only ledger errors
/// bubble up as [`HandlerError`] so the channel requeues the message.
#[derive(Clone)]
pub struct JobRunner {
    ledger: Arc<dyn JobLedger>,
    detector: Arc<dyn Detector>,
    ledger_timeout: Duration,
    detector_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        detector: Arc<dyn Detector>,
        ledger_timeout: Duration,
        detector_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            detector,
            ledger_timeout,
            detector_timeout,
        }
    }

    async fn on_success(
        &self,
        job_id: Uuid,
        result_url: &str,
        logos: &[LogoDetection],
    ) -> Result<(), HandlerError> {
        let res = bounded(
            self.ledger_timeout,
            self.ledger.update_job_result(
                job_id,
                JobStatus::Completed,
                result_url,
                logos,
                Utc::now(),
            ),
        )
        .await?;

        match res {
            Transition::Applied(job) => {
                info!(%job_id, logos = job.logos.len(), "job completed");
            }
            Transition::Rejected { current } => {
                warn!(%job_id, ?current, "result not recorded; job no longer processing");
            }
        }
        Ok(())
    }

    async fn on_failure(&self, job_id: Uuid, reason: &str) -> Result<(), HandlerError> {
        let res = bounded(
            self.ledger_timeout,
            self.ledger
                .update_job_error(job_id, JobStatus::Failed, reason),
        )
        .await?;

        match res {
            Transition::Applied(_) => info!(%job_id, "job failed"),
            Transition::Rejected { current } => {
                warn!(%job_id, ?current, "failure not recorded; job no longer processing");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for JobRunner {
    #[instrument(skip(self, message), fields(job_id = %message.id))]
    async fn handle(&self, message: QueueMessage) -> Result<(), HandlerError> {
        let job_id = message.id;

        // 1) claim
        let claimed = bounded(self.ledger_timeout, self.ledger.mark_processing(job_id)).await?;
        let job = match claimed {
            Transition::Applied(job) => job,
            Transition::Rejected {
                current: Some(status),
            } => {
                // redelivery of a job that already reached a terminal state
                info!(%job_id, %status, "skipping message for settled job");
                return Ok(());
            }
            Transition::Rejected { current: None } => {
                warn!(%job_id, "no ledger row for message; acknowledging");
                return Ok(());
            }
        };

        // 2) detect
        let request = DetectionRequest {
            job_id,
            image_url: job.upload_url.clone(),
            s3_key: job.source_key.clone(),
        };
        let outcome = bounded(self.detector_timeout, self.detector.detect(&request)).await;

        // 3) settle
        match outcome {
            Ok(detection) => {
                self.on_success(job_id, &detection.result_url, &detection.logos)
                    .await
            }
            Err(e) => {
                error!(%job_id, error = %e, "detection failed");
                self.on_failure(job_id, &e.to_string()).await
            }
        }
    }
}
