//! Pluggable delivery of operator warnings to an external sink.
//!
//! Generalized from a chat-specific card format down to a plain JSON webhook
//! POST: the router has no opinion on which chat platform an operator wires
//! up, only that a warning eventually reaches one.

use async_trait::async_trait;
use rc_common::Warning;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, warning: &Warning) -> Result<(), NotificationError>;
}

pub struct NoOpNotificationService;

#[async_trait]
impl NotificationService for NoOpNotificationService {
    async fn notify(&self, _warning: &Warning) -> Result<(), NotificationError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    category: &'a str,
    severity: &'a str,
    message: &'a str,
    source: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Posts a flat JSON body to an operator-configured webhook URL. No
/// platform-specific card formatting: the receiving side decides how to
/// render it.
pub struct WebhookNotificationService {
    client: Client,
    webhook_url: String,
}

impl WebhookNotificationService {
    pub fn new(webhook_url: String) -> Self {
        Self { client: Client::builder().timeout(Duration::from_secs(10)).build().expect("reqwest client"), webhook_url }
    }
}

#[async_trait]
impl NotificationService for WebhookNotificationService {
    async fn notify(&self, warning: &Warning) -> Result<(), NotificationError> {
        let payload = WebhookPayload {
            category: category_label(warning.category),
            severity: severity_label(warning.severity),
            message: &warning.message,
            source: &warning.source,
            timestamp: warning.timestamp,
        };

        let response = self.client.post(&self.webhook_url).json(&payload).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "webhook notification rejected by receiver");
        }
        Ok(())
    }
}

fn category_label(category: rc_common::WarningCategory) -> &'static str {
    use rc_common::WarningCategory::*;
    match category {
        Routing => "routing",
        Configuration => "configuration",
        RateLimiting => "rate_limiting",
        PoolHealth => "pool_health",
        ConsumerHealth => "consumer_health",
        QueueHealth => "queue_health",
    }
}

fn severity_label(severity: rc_common::WarningSeverity) -> &'static str {
    use rc_common::WarningSeverity::*;
    match severity {
        Info => "info",
        Warning => "warning",
        Error => "error",
        Critical => "critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_common::{WarningCategory, WarningSeverity};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_flat_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let service = WebhookNotificationService::new(server.uri());
        let warning = Warning::new(WarningCategory::PoolHealth, WarningSeverity::Critical, "pool stalled", "test");
        assert!(service.notify(&warning).await.is_ok());
    }

    #[tokio::test]
    async fn noop_never_fails() {
        let service = NoOpNotificationService;
        let warning = Warning::new(WarningCategory::Routing, WarningSeverity::Info, "m", "test");
        assert!(service.notify(&warning).await.is_ok());
    }
}
