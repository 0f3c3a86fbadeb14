use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::DetectorConfig;
use crate::error::ProcessingError;
use crate::jobs::model::LogoDetection;

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRequest {
    pub job_id: Uuid,
    pub image_url: String,
    pub s3_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Detection {
    pub result_url: String,
    #[serde(default, alias = "logos_found")]
    pub logos: Vec<LogoDetection>,
}

/// External logo detector. Opaque to the pipeline.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, request: &DetectionRequest) -> Result<Detection, ProcessingError>;
}

/// Calls a detection service over HTTP: `POST {base}/detect`.
#[derive(Clone)]
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(cfg: &DetectorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/detect", cfg.url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    async fn detect(&self, request: &DetectionRequest) -> Result<Detection, ProcessingError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| ProcessingError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProcessingError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let detection: Detection = resp
            .json()
            .await
            .map_err(|e| ProcessingError::BadResponse(e.to_string()))?;

        debug!(logos = detection.logos.len(), "detector returned result");
        Ok(detection)
    }
}
