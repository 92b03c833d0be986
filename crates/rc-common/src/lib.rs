//! Shared wire types and error taxonomy for the RelayCore message router.
//!
//! This crate has no async runtime dependency of its own: it is the vocabulary
//! that `rc-queue` (broker adapters) and `rc-router` (the routing engine)
//! share, so that neither has to depend on the other to exchange a message.

pub mod logging;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The unit of work the router owns, decoded from an upstream queue message
/// body. See the wire format in the project README / operator docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    #[serde(default)]
    pub broker_message_id: Option<String>,
    pub pool_code: String,
    pub auth_token: String,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl MessagePointer {
    /// The router's identity for a delivery attempt: the broker's physical
    /// redelivery id when present, else the application id.
    pub fn pipeline_key(&self) -> &str {
        self.broker_message_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    HTTP,
}

/// Per-pool concurrency and rate-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "PoolConfig::default_max_queue_depth")]
    pub max_queue_depth: u32,
}

impl PoolConfig {
    fn default_max_queue_depth() -> u32 {
        200
    }
}

/// Which broker a queue mapping talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BrokerKind {
    Fifo,
    Jms,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMapping {
    pub queue_id: String,
    pub kind: BrokerKind,
    pub url: String,
}

/// The control plane's declarative desired state, reconciled against the
/// live set of pools and consumers on each refresh.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub queues: Vec<QueueMapping>,
}

/// Outcome of one Mediator attempt. Produced only by the Mediator, consumed
/// only by a pool worker.
#[derive(Debug, Clone, PartialEq)]
pub enum MediationResult {
    Success,
    Nack { delay_seconds: u32, reason: String },
    ConfigError { reason: String },
}

impl MediationResult {
    /// Whether the breaker should count this call as a failure. `circuit
    /// open` nacks are pass-through (the breaker produced them, so they must
    /// not feed back into it).
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(self, MediationResult::Nack { reason, .. } if reason != "circuit open")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    Routing,
    Configuration,
    RateLimiting,
    PoolHealth,
    ConsumerHealth,
    QueueHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Warning {
    pub fn new(category: WarningCategory, severity: WarningSeverity, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message: message.into(),
            source: source.into(),
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("queue error: {0}")]
    Queue(String),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("mediation error: {0}")]
    Mediation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("duplicate message: {0}")]
    DuplicateMessage(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_key_prefers_broker_id() {
        let p = MessagePointer {
            id: "app-1".into(),
            broker_message_id: Some("broker-1".into()),
            pool_code: "P".into(),
            auth_token: "t".into(),
            mediation_type: MediationType::HTTP,
            mediation_target: "https://example.test".into(),
            message_group_id: None,
            batch_id: None,
        };
        assert_eq!(p.pipeline_key(), "broker-1");
    }

    #[test]
    fn pipeline_key_falls_back_to_app_id() {
        let p = MessagePointer {
            id: "app-1".into(),
            broker_message_id: None,
            pool_code: "P".into(),
            auth_token: "t".into(),
            mediation_type: MediationType::HTTP,
            mediation_target: "https://example.test".into(),
            message_group_id: None,
            batch_id: None,
        };
        assert_eq!(p.pipeline_key(), "app-1");
    }

    #[test]
    fn circuit_open_nack_does_not_count_as_breaker_failure() {
        let r = MediationResult::Nack { delay_seconds: 60, reason: "circuit open".into() };
        assert!(!r.counts_as_breaker_failure());
        let r2 = MediationResult::Nack { delay_seconds: 10, reason: "server error".into() };
        assert!(r2.counts_as_breaker_failure());
    }
}
