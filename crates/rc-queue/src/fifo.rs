//! Cloud FIFO queue consumer (AWS SQS FIFO-queue shaped semantics).
//!
//! Acknowledgement protocol: `ack` deletes the message by receipt handle;
//! `nack(Some(delay))` changes the message's visibility timeout to `delay`
//! seconds; `nack(None)` takes no action and lets the existing visibility
//! timeout lapse on its own, which is this broker's natural redelivery path.

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use rc_common::MessagePointer;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::{MessageCallback, QueueConsumer, QueueError, QueueMetrics, Result, RouteSink};

/// Long-poll wait time in seconds. The broker's own cap is 20s; we stay
/// under it so shutdown stays responsive.
const WAIT_TIME_SECONDS: i32 = 5;
const MAX_BATCH: i32 = 10;

pub struct FifoQueueConsumer {
    client: Client,
    queue_url: String,
    queue_id: String,
    visibility_timeout_seconds: i32,
    running: AtomicBool,
    last_poll_at: Mutex<Instant>,
    total_polled: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl FifoQueueConsumer {
    pub fn new(client: Client, queue_url: String, queue_id: String, visibility_timeout_seconds: i32) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            client,
            queue_url,
            queue_id,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
            last_poll_at: Mutex::new(Instant::now()),
            total_polled: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    fn decode(&self, body: &str) -> Result<MessagePointer> {
        serde_json::from_str(body).map_err(QueueError::from)
    }

    async fn poll_once(&self) -> Result<Vec<(MessagePointer, String, Option<String>)>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(MAX_BATCH)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(WAIT_TIME_SECONDS)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let raw = result.messages.unwrap_or_default();
        let mut decoded = Vec::with_capacity(raw.len());
        for msg in raw {
            let Some(body) = msg.body() else { continue };
            let Some(receipt) = msg.receipt_handle() else { continue };
            match self.decode(body) {
                Ok(mut pointer) => {
                    if pointer.broker_message_id.is_none() {
                        pointer.broker_message_id = msg.message_id().map(|s| s.to_string());
                    }
                    decoded.push((pointer, receipt.to_string(), msg.message_id().map(|s| s.to_string())));
                }
                Err(e) => {
                    // Malformed messages are not retried: ack and move on.
                    warn!(queue = %self.queue_id, error = %e, "malformed message body, acking");
                    let _ = self
                        .client
                        .delete_message()
                        .queue_url(&self.queue_url)
                        .receipt_handle(receipt)
                        .send()
                        .await;
                }
            }
        }

        if !decoded.is_empty() {
            self.total_polled.fetch_add(decoded.len() as u64, Ordering::Relaxed);
        }
        Ok(decoded)
    }
}

struct FifoCallback {
    client: Client,
    queue_url: String,
    receipt_handle: String,
}

#[async_trait]
impl MessageCallback for FifoCallback {
    async fn ack(&self) {
        if let Err(e) = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
        {
            error!(error = %e, "ack (delete) failed");
        }
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        let Some(delay) = delay_seconds else {
            // Let the existing visibility timeout lapse.
            return;
        };
        if let Err(e) = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(delay as i32)
            .send()
            .await
        {
            error!(error = %e, "nack (visibility change) failed");
        }
    }

    async fn extend_visibility(&self, extension_seconds: u32) {
        if let Err(e) = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(extension_seconds as i32)
            .send()
            .await
        {
            warn!(error = %e, "visibility extension failed");
        }
    }
}

#[async_trait]
impl QueueConsumer for FifoQueueConsumer {
    fn queue_identifier(&self) -> &str {
        &self.queue_id
    }

    async fn start(self: Arc<Self>, sink: Arc<dyn RouteSink>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let consumer = self.clone();

        tokio::spawn(async move {
            info!(queue = %consumer.queue_id, "fifo consumer starting");
            loop {
                if !consumer.running.load(Ordering::SeqCst) {
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = consumer.poll_once() => {
                        *consumer.last_poll_at.lock().await = Instant::now();
                        match result {
                            Ok(messages) => {
                                for (pointer, receipt_handle, _broker_id) in messages {
                                    let callback: Arc<dyn MessageCallback> = Arc::new(FifoCallback {
                                        client: consumer.client.clone(),
                                        queue_url: consumer.queue_url.clone(),
                                        receipt_handle,
                                    });
                                    sink.route(pointer, callback, &consumer.queue_id).await;
                                }
                            }
                            Err(e) => {
                                error!(queue = %consumer.queue_id, error = %e, "poll failed, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
            info!(queue = %consumer.queue_id, "fifo consumer stopped");
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
        let attrs = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let attributes = attrs.attributes();
        let pending = attributes
            .and_then(|a| a.get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let in_flight = attributes
            .and_then(|a| a.get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        debug!(queue = %self.queue_id, pending, in_flight, "fetched queue attributes");

        Ok(Some(QueueMetrics {
            queue_identifier: self.queue_id.clone(),
            pending_messages: pending,
            in_flight_messages: in_flight,
        }))
    }
}
