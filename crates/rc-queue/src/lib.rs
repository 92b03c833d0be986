//! Broker-facing half of the router: the `QueueConsumer` contract each
//! upstream broker variant implements, and the acknowledgement protocol
//! (`MessageCallback`) a consumer hands to the router for every message it
//! hands off.
//!
//! This crate knows nothing about pools, ordering, or mediation — it only
//! knows how to long-poll a broker, decode a `MessagePointer`, and translate
//! an ack/nack decision back into broker-specific wire calls.

pub mod error;

#[cfg(feature = "fifo-queue")]
pub mod fifo;

#[cfg(feature = "jms-queue")]
pub mod jms;

pub use error::QueueError;

use async_trait::async_trait;
use rc_common::MessagePointer;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Point-in-time view of a queue's backlog, used for health reporting.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub queue_identifier: String,
    pub pending_messages: u64,
    pub in_flight_messages: u64,
}

/// The broker-specific acknowledgement handle bound to one dequeued message.
/// A router or pool worker calls exactly one of `ack`/`nack` on this, exactly
/// once, when it has a final disposition for the message.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    /// Remove the message from the upstream queue permanently.
    async fn ack(&self);

    /// Ask the upstream broker to redeliver after `delay_seconds`, or per the
    /// broker's default redelivery policy if `None`.
    async fn nack(&self, delay_seconds: Option<u32>);

    /// Push back the broker's redelivery deadline by `extension_seconds`
    /// without resolving the message. Brokers with no such concept (AMQP) use
    /// the default no-op.
    async fn extend_visibility(&self, _extension_seconds: u32) {}
}

/// What a `QueueConsumer` hands a dequeued message to. The router implements
/// this; consumers depend only on the trait, never on the router's
/// concrete type, so `rc-queue` never depends on `rc-router`.
#[async_trait]
pub trait RouteSink: Send + Sync {
    async fn route(&self, pointer: MessagePointer, callback: Arc<dyn MessageCallback>, queue_id: &str);
}

/// One concrete variant per upstream broker type.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Stable identifier used in telemetry and the in-flight tracker.
    fn queue_identifier(&self) -> &str;

    /// Spawn the polling loop. Each decoded message is handed to `sink`
    /// along with a `MessageCallback` bound to this consumer's broker
    /// acknowledgement protocol. Returns once the poll loop has been
    /// spawned (it runs in the background until `stop` is called).
    async fn start(self: Arc<Self>, sink: Arc<dyn RouteSink>);

    /// Halt polling, close the broker connection, and wait for outstanding
    /// ack/nack callbacks to flush.
    async fn stop(&self);

    /// Seconds since this consumer's last successful poll cycle. Used by the
    /// router's health reporting to flag stalled consumers.
    fn seconds_since_last_poll(&self) -> u64;

    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}
