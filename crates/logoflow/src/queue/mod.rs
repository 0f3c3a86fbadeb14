use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{DeliveryError, PersistenceError};
use crate::jobs::model::QueueMessage;

pub mod amqp;

pub use amqp::AmqpChannel;

/// Durable, at-least-once transport between the coordinator and the consumer.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn publish(&self, message: &QueueMessage) -> Result<(), DeliveryError>;

    /// Drains the job queue into `handler` with at most one unacknowledged
    /// message in flight. Runs until the broker stream ends.
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<(), DeliveryError>;
}

/// Error returned by a handler when the message should be redelivered.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] PersistenceError),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<(), HandlerError>;
}

/// What to tell the broker about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the queue.
    Ack,
    /// Negative-ack with requeue.
    Requeue,
    /// Negative-ack without requeue. Used for poison messages.
    Drop,
}

/// Parses one delivery body and runs the handler on it.
///
/// Shared by every channel adapter so the acknowledgment rules live in one place.
pub async fn dispatch(body: &[u8], handler: &dyn MessageHandler) -> Disposition {
    let message: QueueMessage = match serde_json::from_slice(body) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "dropping malformed job message");
            return Disposition::Drop;
        }
    };

    let job_id = message.id;
    match handler.handle(message).await {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            warn!(%job_id, error = %e, "handler failed; requeueing message");
            Disposition::Requeue
        }
    }
}
