//! JMS/broker-style queue consumer over AMQP (lapin).
//!
//! Acknowledgement protocol: `ack` acknowledges only the one delivery tag it
//! is bound to (never basic_ack with `multiple=true`); `nack(None)` rejects
//! without requeue delay information, letting the broker's own fixed
//! redelivery policy resurface the message; `nack(Some(delay))` republishes
//! onto the same queue with the broker's scheduled-delivery header set, since
//! AMQP 0-9-1 has no native per-message delay primitive.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use rc_common::MessagePointer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::{MessageCallback, QueueConsumer, QueueError, QueueMetrics, Result, RouteSink};

const PREFETCH_COUNT: u16 = 20;
const SCHEDULED_DELAY_HEADER: &str = "x-delay";

pub struct JmsQueueConsumer {
    amqp_url: String,
    queue_name: String,
    queue_id: String,
    running: AtomicBool,
    last_poll_at: Mutex<Instant>,
    shutdown_tx: broadcast::Sender<()>,
}

impl JmsQueueConsumer {
    pub fn new(amqp_url: String, queue_name: String, queue_id: String) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            amqp_url,
            queue_name,
            queue_id,
            running: AtomicBool::new(true),
            last_poll_at: Mutex::new(Instant::now()),
            shutdown_tx,
        }
    }

    async fn connect(&self) -> Result<(Connection, Channel)> {
        let conn = Connection::connect(&self.amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        let channel = conn.create_channel().await.map_err(|e| QueueError::Broker(e.to_string()))?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        channel
            .queue_declare(&self.queue_name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok((conn, channel))
    }
}

struct JmsCallback {
    channel: Channel,
    delivery_tag: u64,
    queue_name: String,
    body: Vec<u8>,
}

#[async_trait]
impl MessageCallback for JmsCallback {
    async fn ack(&self) {
        if let Err(e) = self
            .channel
            .basic_ack(self.delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            error!(error = %e, "ack failed");
        }
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        let Some(delay) = delay_seconds else {
            if let Err(e) = self
                .channel
                .basic_nack(self.delivery_tag, BasicNackOptions { multiple: false, requeue: false })
                .await
            {
                error!(error = %e, "nack failed");
            }
            return;
        };

        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(SCHEDULED_DELAY_HEADER), AMQPValue::LongInt((delay as i32) * 1000));
        let properties = BasicProperties::default().with_headers(headers);

        let published = self
            .channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &self.body,
                properties,
            )
            .await;

        match published {
            Ok(_) => {
                if let Err(e) = self
                    .channel
                    .basic_ack(self.delivery_tag, BasicAckOptions { multiple: false })
                    .await
                {
                    error!(error = %e, "ack after scheduled republish failed");
                }
            }
            Err(e) => {
                error!(error = %e, "scheduled republish failed, rejecting without requeue delay");
                let _ = self
                    .channel
                    .basic_nack(self.delivery_tag, BasicNackOptions { multiple: false, requeue: true })
                    .await;
            }
        }
    }
}

#[async_trait]
impl QueueConsumer for JmsQueueConsumer {
    fn queue_identifier(&self) -> &str {
        &self.queue_id
    }

    async fn start(self: Arc<Self>, sink: Arc<dyn RouteSink>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let consumer = self.clone();

        tokio::spawn(async move {
            info!(queue = %consumer.queue_id, "jms consumer starting");

            let (conn, channel) = match consumer.connect().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(queue = %consumer.queue_id, error = %e, "failed to connect to broker, consumer will not run");
                    return;
                }
            };

            let mut stream = match channel
                .basic_consume(
                    &consumer.queue_name,
                    &format!("rc-router-{}", consumer.queue_id),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    error!(queue = %consumer.queue_id, error = %e, "failed to start basic_consume");
                    return;
                }
            };

            loop {
                if !consumer.running.load(Ordering::SeqCst) {
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    next = stream.next() => {
                        *consumer.last_poll_at.lock().await = Instant::now();
                        match next {
                            Some(Ok(delivery)) => {
                                match serde_json::from_slice::<MessagePointer>(&delivery.data) {
                                    Ok(pointer) => {
                                        let callback: Arc<dyn MessageCallback> = Arc::new(JmsCallback {
                                            channel: channel.clone(),
                                            delivery_tag: delivery.delivery_tag,
                                            queue_name: consumer.queue_name.clone(),
                                            body: delivery.data.clone(),
                                        });
                                        sink.route(pointer, callback, &consumer.queue_id).await;
                                    }
                                    Err(e) => {
                                        warn!(queue = %consumer.queue_id, error = %e, "malformed message body, acking");
                                        let _ = delivery.ack(BasicAckOptions { multiple: false }).await;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                error!(queue = %consumer.queue_id, error = %e, "consumer stream error, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                            None => break,
                        }
                    }
                }
            }

            let _ = conn.close(0, "shutting down").await;
            info!(queue = %consumer.queue_id, "jms consumer stopped");
        });
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    fn seconds_since_last_poll(&self) -> u64 {
        self.last_poll_at
            .try_lock()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}
