#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use logoflow::detector::{Detection, DetectionRequest, Detector};
use logoflow::error::{DeliveryError, PersistenceError, ProcessingError, StorageError};
use logoflow::jobs::model::BoundingBox;
use logoflow::jobs::{
    IngestCoordinator, IngestPolicy, IngestRequest, Job, JobLedger, JobRunner, JobStatus,
    LogoDetection, NewJob, QueueMessage, Transition,
};
use logoflow::queue::{dispatch, DeliveryChannel, Disposition, MessageHandler};
use logoflow::storage::BlobStore;

// ----------------------------
// Shared event log
// ----------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BlobPut(String),
    BlobSigned(String),
    LedgerCreated { id: Uuid, key: String },
    LedgerMoved { id: Uuid, from: JobStatus, to: JobStatus },
    Published(Uuid),
    Detected(Uuid),
    Acked(Option<Uuid>),
    Requeued(Option<Uuid>),
    Dropped,
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, e: Event) {
        self.0.lock().unwrap().push(e);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.snapshot().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.snapshot().iter().filter(|e| pred(e)).count()
    }
}

// ----------------------------
// Blob store
// ----------------------------

pub struct MemoryBlobStore {
    events: EventLog,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_put: AtomicBool,
    pub fail_sign: AtomicBool,
    pub put_delay: Mutex<Option<Duration>>,
}

impl MemoryBlobStore {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            objects: Mutex::new(HashMap::new()),
            fail_put: AtomicBool::new(false),
            fail_sign: AtomicBool::new(false),
            put_delay: Mutex::new(None),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        size: u64,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(anyhow::anyhow!("bucket unavailable")));
        }
        let delay = *self.put_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        assert_eq!(body.len() as u64, size);
        self.objects.lock().unwrap().insert(key.to_string(), body);
        self.events.push(Event::BlobPut(key.to_string()));
        Ok(format!("mem://{key}"))
    }

    async fn signed_put_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(anyhow::anyhow!("signer unavailable")));
        }
        Ok(format!(
            "https://blobs.test/{key}?method=PUT&expires={}",
            ttl.as_secs()
        ))
    }

    async fn signed_get_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(anyhow::anyhow!("signer unavailable")));
        }
        self.events.push(Event::BlobSigned(key.to_string()));
        Ok(format!(
            "https://blobs.test/{key}?method=GET&expires={}",
            ttl.as_secs()
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

// ----------------------------
// Ledger
// ----------------------------

/// Enforces the same transition rules as the Postgres repo's guarded updates.
pub struct MemoryLedger {
    events: EventLog,
    rows: Mutex<HashMap<Uuid, Job>>,
    pub fail_create: AtomicBool,
    pub fail_updates: AtomicBool,
    /// Number of upcoming `mark_processing` calls that fail.
    pub mark_failures: AtomicUsize,
}

impl MemoryLedger {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            rows: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            mark_failures: AtomicUsize::new(0),
        }
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Job> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Inserts a row in any state, bypassing the transition rules.
    pub fn seed(&self, job: Job) {
        self.rows.lock().unwrap().insert(job.id, job);
    }

    fn unavailable() -> PersistenceError {
        PersistenceError::Backend(anyhow::anyhow!("connection refused"))
    }

    fn apply(&self, id: Uuid, to: JobStatus, write: impl FnOnce(&mut Job)) -> Transition {
        let mut rows = self.rows.lock().unwrap();
        let Some(job) = rows.get_mut(&id) else {
            return Transition::Rejected { current: None };
        };
        if !job.status.can_transition_to(to) {
            return Transition::Rejected {
                current: Some(job.status),
            };
        }

        let from = job.status;
        let prev_updated = job.updated_at;
        job.status = to;
        job.updated_at = Utc::now().max(prev_updated);
        write(job);
        if to.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(job.updated_at);
        }

        self.events.push(Event::LedgerMoved { id, from, to });
        Transition::Applied(job.clone())
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn create_job(&self, job: NewJob) -> Result<Job, PersistenceError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let now = Utc::now();
        let row = Job {
            id: job.id,
            status: job.status,
            source_key: job.source_key.clone(),
            upload_url: job.upload_url,
            result_url: None,
            logos: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&job.id) {
            return Err(PersistenceError::Corrupt(format!("duplicate id {}", job.id)));
        }
        rows.insert(job.id, row.clone());
        self.events.push(Event::LedgerCreated {
            id: job.id,
            key: job.source_key,
        });
        Ok(row)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, PersistenceError> {
        Ok(self.job(id))
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Transition, PersistenceError> {
        let remaining = self.mark_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.mark_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unavailable());
        }
        Ok(self.apply(id, JobStatus::Processing, |_| {}))
    }

    async fn update_job_error(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: &str,
    ) -> Result<Transition, PersistenceError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        assert_eq!(status, JobStatus::Failed);
        Ok(self.apply(id, status, |job| {
            job.error_message = Some(error_message.to_string());
            job.result_url = None;
        }))
    }

    async fn compensate_pending(
        &self,
        id: Uuid,
        error_message: &str,
    ) -> Result<Transition, PersistenceError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        if let Some(job) = self.job(id) {
            if job.status != JobStatus::Pending {
                return Ok(Transition::Rejected {
                    current: Some(job.status),
                });
            }
        }
        Ok(self.apply(id, JobStatus::Failed, |job| {
            job.error_message = Some(error_message.to_string());
        }))
    }

    async fn update_job_result(
        &self,
        id: Uuid,
        status: JobStatus,
        result_url: &str,
        logos: &[LogoDetection],
        completed_at: DateTime<Utc>,
    ) -> Result<Transition, PersistenceError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        assert_eq!(status, JobStatus::Completed);
        Ok(self.apply(id, status, |job| {
            job.result_url = Some(result_url.to_string());
            job.logos = logos.to_vec();
            job.error_message = None;
            if job.completed_at.is_none() {
                job.completed_at = Some(completed_at.max(job.updated_at));
            }
        }))
    }
}

// ----------------------------
// Delivery channel
// ----------------------------

/// In-process queue with the same ack discipline as the AMQP adapter.
pub struct MemoryChannel {
    events: EventLog,
    queue: Mutex<VecDeque<Vec<u8>>>,
    pub fail_publish: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    deliveries: AtomicUsize,
    /// Stops `consume` after this many deliveries.
    pub delivery_cap: AtomicUsize,
}

impl MemoryChannel {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            queue: Mutex::new(VecDeque::new()),
            fail_publish: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            deliveries: AtomicUsize::new(0),
            delivery_cap: AtomicUsize::new(1_000),
        }
    }

    pub fn push_raw(&self, body: impl Into<Vec<u8>>) {
        self.queue.lock().unwrap().push_back(body.into());
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn queued(&self) -> Vec<QueueMessage> {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| serde_json::from_slice(b).ok())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryChannel for MemoryChannel {
    async fn publish(&self, message: &QueueMessage) -> Result<(), DeliveryError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected);
        }
        let body = serde_json::to_vec(message)?;
        self.queue.lock().unwrap().push_back(body);
        self.events.push(Event::Published(message.id));
        Ok(())
    }

    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<(), DeliveryError> {
        loop {
            if self.deliveries.load(Ordering::SeqCst) >= self.delivery_cap.load(Ordering::SeqCst) {
                break;
            }
            let next = self.queue.lock().unwrap().pop_front();
            let Some(body) = next else {
                break;
            };

            self.deliveries.fetch_add(1, Ordering::SeqCst);
            let held = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(held, Ordering::SeqCst);

            let id = serde_json::from_slice::<QueueMessage>(&body)
                .ok()
                .map(|m| m.id);

            match dispatch(&body, handler.as_ref()).await {
                Disposition::Ack => self.events.push(Event::Acked(id)),
                Disposition::Drop => self.events.push(Event::Dropped),
                Disposition::Requeue => {
                    self.events.push(Event::Requeued(id));
                    self.queue.lock().unwrap().push_back(body);
                }
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ----------------------------
// Detector
// ----------------------------

#[derive(Debug, Clone)]
pub enum DetectorMode {
    Succeed(Detection),
    Reject,
    Hang,
}

pub struct StubDetector {
    events: EventLog,
    mode: Mutex<DetectorMode>,
    calls: AtomicUsize,
}

impl StubDetector {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            mode: Mutex::new(DetectorMode::Succeed(detection())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: DetectorMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for StubDetector {
    async fn detect(&self, request: &DetectionRequest) -> Result<Detection, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.push(Event::Detected(request.job_id));

        let mode = self.mode.lock().unwrap().clone();
        match mode {
            DetectorMode::Succeed(d) => Ok(d),
            DetectorMode::Reject => Err(ProcessingError::Rejected {
                status: 422,
                body: "unsupported image".to_string(),
            }),
            DetectorMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProcessingError::Unavailable("never answered".to_string()))
            }
        }
    }
}

pub fn detection() -> Detection {
    Detection {
        result_url: "https://blobs.test/results/preserved.png".to_string(),
        logos: vec![LogoDetection {
            bounding_box: BoundingBox {
                x: 10,
                y: 20,
                width: 64,
                height: 32,
            },
            confidence: 0.93,
            logo_type: "wordmark".to_string(),
            s3_key: None,
        }],
    }
}

// ----------------------------
// Harness
// ----------------------------

pub struct Harness {
    pub events: EventLog,
    pub blobs: Arc<MemoryBlobStore>,
    pub ledger: Arc<MemoryLedger>,
    pub channel: Arc<MemoryChannel>,
    pub detector: Arc<StubDetector>,
    pub coordinator: IngestCoordinator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(IngestPolicy::default())
    }

    pub fn with_policy(policy: IngestPolicy) -> Self {
        let events = EventLog::default();
        let blobs = Arc::new(MemoryBlobStore::new(events.clone()));
        let ledger = Arc::new(MemoryLedger::new(events.clone()));
        let channel = Arc::new(MemoryChannel::new(events.clone()));
        let detector = Arc::new(StubDetector::new(events.clone()));

        let coordinator =
            IngestCoordinator::new(blobs.clone(), ledger.clone(), channel.clone(), policy);

        Self {
            events,
            blobs,
            ledger,
            channel,
            detector,
            coordinator,
        }
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::new(
            self.ledger.clone(),
            self.detector.clone(),
            Duration::from_secs(5),
            Duration::from_millis(200),
        )
    }

    /// Drains the channel through a fresh consumer.
    pub async fn drain(&self) {
        self.channel
            .consume(Arc::new(self.runner()))
            .await
            .expect("memory channel never fails to consume");
    }
}

pub fn jpeg(size: usize) -> IngestRequest {
    IngestRequest {
        file_name: "logo.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        body: vec![0xFF; size],
    }
}

pub fn pending_job(id: Uuid) -> Job {
    let now = Utc::now();
    Job {
        id,
        status: JobStatus::Pending,
        source_key: format!("original/{id}/logo.jpg"),
        upload_url: format!("https://blobs.test/original/{id}/logo.jpg"),
        result_url: None,
        logos: Vec::new(),
        error_message: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

// ----------------------------
// Postgres
// ----------------------------

/// Connects to `TEST_DATABASE_URL`, migrates and truncates. `None` when unset.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}
