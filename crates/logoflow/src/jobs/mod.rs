pub mod ingest;
pub mod model;
pub mod repo;
pub mod retry;
pub mod runner;

pub use ingest::{IngestCoordinator, IngestPolicy, IngestReceipt, IngestRequest};
pub use model::{Job, JobStatus, LogoDetection, NewJob, QueueMessage};
pub use repo::{JobLedger, JobsRepo, Transition};
pub use runner::JobRunner;
