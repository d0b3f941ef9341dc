//! Broker gateway: delayed and immediate publishing plus manual-ack
//! consumption on RabbitMQ (lapin). Delayed delivery rides the
//! x-delayed-message exchange plugin, which caps per-message delays at
//! 24 hours; longer lead times are covered by the periodic sweeper instead.

use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::config::BrokerConfig;
use crate::error::{disposition, AppError, AppResult, ConsumeError, Disposition};

pub const EXCHANGE_DELAYED: &str = "scheduler.delayed";
pub const EXCHANGE_NOTIFICATION: &str = "notification.topic";
pub const EXCHANGE_EVENTS: &str = "events.topic";
pub const EXCHANGE_DLX: &str = "dlx.topic";

pub const QUEUE_CHECK_IN_REMINDER: &str = "scheduler.check_in.reminder";
pub const QUEUE_CHECK_IN_TIMEOUT: &str = "scheduler.check_in.timeout";
pub const QUEUE_JOURNEY_REMINDER: &str = "scheduler.journey.reminder";
pub const QUEUE_JOURNEY_TIMEOUT: &str = "scheduler.journey.timeout";
pub const QUEUE_NOTIFICATION_SMS: &str = "notification.sms";

pub const EVENT_KEY_CHECK_IN_TIMEOUT: &str = "check_in.timeout";
pub const EVENT_KEY_JOURNEY_TIMEOUT: &str = "journey.timeout";
pub const EVENT_KEY_QUOTA_DEPLETED: &str = "quota.depleted";

/// Routing key for an outbound SMS message of the given category.
pub fn sms_routing_key(category: &str) -> String {
    format!("notification.sms.{category}")
}

/// Validate and clamp a requested delay against the broker ceiling.
/// Negative delays collapse to zero; anything above the ceiling is a hard
/// error so the caller can fall back to the sweeper.
fn validate_delay(delay_ms: i64, max_ms: i64) -> Result<i64, AppError> {
    if delay_ms > max_ms {
        return Err(AppError::DelayTooLarge {
            requested_ms: delay_ms,
            max_ms,
        });
    }
    Ok(delay_ms.max(0))
}

pub struct BrokerGateway {
    conn: Connection,
    /// Publisher channel shared by all producers, lazily rebuilt when the
    /// broker closes it. Consumers open their own channels.
    publisher: RwLock<Option<Channel>>,
    max_delay_ms: i64,
}

impl BrokerGateway {
    pub async fn connect(cfg: &BrokerConfig, max_delay_seconds: i64) -> AppResult<Self> {
        let conn = Connection::connect(&cfg.url, ConnectionProperties::default()).await?;
        tracing::info!("Connected to broker");
        Ok(Self {
            conn,
            publisher: RwLock::new(None),
            max_delay_ms: max_delay_seconds * 1000,
        })
    }

    /// Declare the full topology: the delayed exchange, the immediate
    /// topic exchanges, every work queue and its paired DLQ. Safe to call
    /// on every boot; declarations are idempotent.
    pub async fn declare_topology(&self) -> AppResult<()> {
        let channel = self.conn.create_channel().await?;

        let mut delayed_args = FieldTable::default();
        delayed_args.insert("x-delayed-type".into(), AMQPValue::LongString("topic".into()));
        channel
            .exchange_declare(
                EXCHANGE_DELAYED,
                ExchangeKind::Custom("x-delayed-message".to_string()),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                delayed_args,
            )
            .await?;

        for exchange in [EXCHANGE_NOTIFICATION, EXCHANGE_EVENTS, EXCHANGE_DLX] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        let scheduler_queues = [
            QUEUE_CHECK_IN_REMINDER,
            QUEUE_CHECK_IN_TIMEOUT,
            QUEUE_JOURNEY_REMINDER,
            QUEUE_JOURNEY_TIMEOUT,
        ];
        for queue in scheduler_queues {
            self.declare_queue_with_dlq(&channel, queue, EXCHANGE_DELAYED, queue)
                .await?;
        }
        self.declare_queue_with_dlq(
            &channel,
            QUEUE_NOTIFICATION_SMS,
            EXCHANGE_NOTIFICATION,
            "notification.sms.*",
        )
        .await?;

        channel.close(0, "topology declared").await.ok();
        Ok(())
    }

    async fn declare_queue_with_dlq(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> AppResult<()> {
        let dlq = format!("{queue}.dlq");

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(EXCHANGE_DLX.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlq.as_str().into()),
        );
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &dlq,
                EXCHANGE_DLX,
                &dlq,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Publish a JSON body with per-message delayed delivery. The delay is
    /// clamped at zero and rejected above the plugin's 24 h ceiling.
    pub async fn publish_delayed<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        delay_ms: i64,
        body: &T,
    ) -> AppResult<()> {
        let delay_ms = validate_delay(delay_ms, self.max_delay_ms)?;
        let payload = serde_json::to_vec(body)?;

        let mut headers = FieldTable::default();
        headers.insert("x-delay".into(), AMQPValue::LongLongInt(delay_ms));

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_timestamp(unix_now_secs())
            .with_headers(headers);

        let channel = self.publisher_channel().await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    /// Immediate persistent JSON publish.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &T,
    ) -> AppResult<()> {
        let payload = serde_json::to_vec(body)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_timestamp(unix_now_secs());

        let channel = self.publisher_channel().await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    async fn publisher_channel(&self) -> AppResult<Channel> {
        {
            let guard = self.publisher.read().await;
            if let Some(channel) = guard.as_ref() {
                if channel.status().connected() {
                    return Ok(channel.clone());
                }
            }
        }

        let mut guard = self.publisher.write().await;
        // Another producer may have rebuilt the channel while we waited.
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        tracing::debug!("Creating publisher channel");
        let channel = self.conn.create_channel().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Consume a queue with manual acks until shutdown. Each invocation
    /// opens its own channel with the given QoS. The handler outcome drives
    /// the ack decision:
    ///
    /// - `Ok` / `Skip` / `QuotaInsufficient` -> ack
    /// - `NonRetryable` -> nack without requeue (broker dead-letters it)
    /// - `Retryable` -> nack with requeue
    pub async fn consume<F, Fut>(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
        mut shutdown: broadcast::Receiver<()>,
        handler: F,
    ) -> AppResult<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<(), ConsumeError>> + Send,
    {
        let channel = self.conn.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue, consumer_tag, prefetch, "Consumer started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(queue, "Consumer shutting down");
                    break;
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        tracing::warn!(queue, "Consumer stream error: {:?}", e);
                        continue;
                    }
                    None => {
                        tracing::warn!(queue, "Consumer stream closed");
                        break;
                    }
                },
            };

            let result = handler(delivery.data.clone()).await;
            match disposition(&result) {
                Disposition::Ack => {
                    delivery.ack(BasicAckOptions { multiple: false }).await?;
                }
                Disposition::Requeue => {
                    if let Err(e) = &result {
                        tracing::warn!(queue, "Requeueing after transient failure: {e}");
                    }
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            multiple: false,
                        })
                        .await?;
                }
                Disposition::DeadLetter => {
                    if let Err(e) = &result {
                        tracing::error!(queue, "Dead-lettering message: {e}");
                    }
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            multiple: false,
                        })
                        .await?;
                }
            }
        }

        channel.close(0, "consumer stopped").await.ok();
        Ok(())
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;

    #[test]
    fn negative_delay_clamps_to_zero() {
        assert_eq!(validate_delay(-5000, DAY_MS).unwrap(), 0);
    }

    #[test]
    fn in_range_delay_passes_through() {
        assert_eq!(validate_delay(71_700_000, DAY_MS).unwrap(), 71_700_000);
        assert_eq!(validate_delay(DAY_MS, DAY_MS).unwrap(), DAY_MS);
    }

    #[test]
    fn delay_above_ceiling_is_rejected() {
        let err = validate_delay(DAY_MS + 1, DAY_MS).unwrap_err();
        assert!(matches!(err, AppError::DelayTooLarge { .. }));
    }

    #[test]
    fn sms_routing_keys_embed_the_category() {
        assert_eq!(
            sms_routing_key("checkin_reminder"),
            "notification.sms.checkin_reminder"
        );
    }
}
