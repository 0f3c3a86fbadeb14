use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::DeliveryError;
use crate::jobs::model::QueueMessage;
use crate::jobs::retry::{RequeueBackoff, RetryConfig};
use crate::queue::{dispatch, DeliveryChannel, Disposition, MessageHandler};

/// Unacknowledged deliveries a consumer may hold.
pub const PREFETCH: u16 = 1;

const PERSISTENT: u8 = 2;

/// RabbitMQ adapter: durable direct exchange, one durable queue bound by a
/// fixed routing key, persistent publishes with publisher confirms.
pub struct AmqpChannel {
    connection: Connection,
    publisher: Channel,
    cfg: BrokerConfig,
    requeue: RetryConfig,
}

impl AmqpChannel {
    pub async fn connect(cfg: BrokerConfig, requeue: RetryConfig) -> Result<Self, DeliveryError> {
        let connection = Connection::connect(&cfg.url, ConnectionProperties::default()).await?;

        let publisher = connection.create_channel().await?;
        declare_topology(&publisher, &cfg).await?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!(
            exchange = %cfg.exchange,
            queue = %cfg.queue,
            routing_key = %cfg.routing_key,
            "connected to broker"
        );

        Ok(Self {
            connection,
            publisher,
            cfg,
            requeue,
        })
    }

    pub async fn close(&self) -> Result<(), DeliveryError> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

async fn declare_topology(channel: &Channel, cfg: &BrokerConfig) -> Result<(), DeliveryError> {
    channel
        .exchange_declare(
            &cfg.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            &cfg.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            &cfg.queue,
            &cfg.exchange,
            &cfg.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

#[async_trait]
impl DeliveryChannel for AmqpChannel {
    #[instrument(skip(self, message), fields(job_id = %message.id))]
    async fn publish(&self, message: &QueueMessage) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(message)?;

        let props = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(Utc::now().timestamp().max(0) as u64);

        let confirmation = self
            .publisher
            .basic_publish(
                &self.cfg.exchange,
                &self.cfg.routing_key,
                BasicPublishOptions::default(),
                &body,
                props,
            )
            .await?
            .await?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(DeliveryError::Rejected);
        }

        debug!(bytes = body.len(), "published job message");
        Ok(())
    }

    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<(), DeliveryError> {
        let channel = self.connection.create_channel().await?;
        declare_topology(&channel, &self.cfg).await?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await?;

        let tag = format!("logoflow-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                &self.cfg.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.cfg.queue, consumer_tag = %tag, prefetch = PREFETCH, "consuming");

        let mut backoff = RequeueBackoff::new(self.requeue.clone());

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;

            match dispatch(&delivery.data, handler.as_ref()).await {
                Disposition::Ack => {
                    backoff.reset();
                    delivery.ack(BasicAckOptions::default()).await?;
                }
                Disposition::Drop => {
                    backoff.reset();
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await?;
                }
                Disposition::Requeue => {
                    let delay = backoff.on_requeue();
                    warn!(
                        consecutive = backoff.consecutive(),
                        delay_ms = delay.as_millis() as u64,
                        redelivered = delivery.redelivered,
                        "requeueing after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await?;
                }
            }
        }

        info!(consumer_tag = %tag, "broker stream closed");
        Ok(())
    }
}
