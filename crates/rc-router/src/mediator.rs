//! Mediation: the single HTTP attempt that delivers a message to its target.
//!
//! Unlike a typical HTTP client wrapper, `mediate` never retries internally.
//! Every failure is classified into a `MediationResult` and handed back to
//! the pool, which nacks the message and lets the broker's own redelivery
//! cycle drive the retry. The circuit breaker is updated here, once, per
//! attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rc_common::{MediationResult, MediationType, MessagePointer};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct MediationBody<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
    #[serde(rename = "brokerMessageId")]
    broker_message_id: Option<&'a str>,
    #[serde(rename = "mediationType")]
    mediation_type: MediationType,
}

/// Optional acknowledgement envelope a target may return on a 2xx response.
/// Absent or unparseable body means "success" per spec.
#[derive(Deserialize, Default)]
struct AckEnvelope {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(rename = "delaySeconds", default)]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

#[async_trait]
pub trait Mediator: Send + Sync {
    async fn mediate(&self, pointer: &MessagePointer) -> MediationResult;
}

pub struct HttpMediator {
    client: Client,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl HttpMediator {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> reqwest::Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .pool_max_idle_per_host(32)
            .build()?;
        Ok(Self { client, breakers })
    }

    fn breaker_for(&self, pool_code: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(pool_code)
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn mediate(&self, pointer: &MessagePointer) -> MediationResult {
        let breaker = self.breaker_for(&pointer.pool_code);

        if breaker.try_call().is_err() {
            debug!(pool = %pointer.pool_code, message = %pointer.id, "circuit open, short-circuiting mediation");
            return MediationResult::Nack { delay_seconds: 60, reason: "circuit open".to_string() };
        }

        let body = MediationBody {
            message_id: &pointer.id,
            broker_message_id: pointer.broker_message_id.as_deref(),
            mediation_type: pointer.mediation_type,
        };

        let result = self
            .client
            .post(&pointer.mediation_target)
            .bearer_auth(&pointer.auth_token)
            .json(&body)
            .send()
            .await;

        let outcome = classify(result).await;
        if outcome.counts_as_breaker_failure() {
            breaker.record_outcome(false);
        } else if matches!(outcome, MediationResult::Success) {
            breaker.record_outcome(true);
        }
        outcome
    }
}

async fn classify(result: reqwest::Result<reqwest::Response>) -> MediationResult {
    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return MediationResult::Nack { delay_seconds: 30, reason: "mediation timed out".to_string() }
        }
        Err(e) if e.is_connect() => {
            return MediationResult::Nack { delay_seconds: 30, reason: "could not connect to target".to_string() }
        }
        Err(e) => {
            return MediationResult::Nack { delay_seconds: 30, reason: format!("request error: {e}") }
        }
    };

    let status = response.status();

    if status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        if body.is_empty() {
            return MediationResult::Success;
        }
        return match serde_json::from_slice::<AckEnvelope>(&body) {
            Ok(envelope) if !envelope.ack => {
                MediationResult::Nack { delay_seconds: envelope.delay_seconds.unwrap_or(30), reason: "target returned ack=false".to_string() }
            }
            Ok(_) => MediationResult::Success,
            Err(_) => MediationResult::Success,
        };
    }

    if status.as_u16() == 400 {
        return MediationResult::ConfigError { reason: format!("target rejected request as malformed ({status})") };
    }

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return MediationResult::ConfigError { reason: format!("target rejected credentials ({status})") };
    }

    if status.as_u16() == 404 {
        return MediationResult::ConfigError { reason: "mediation target not found".to_string() };
    }

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(60);
        return MediationResult::Nack { delay_seconds: retry_after, reason: "target rate-limited the request".to_string() };
    }

    if status.is_client_error() {
        return MediationResult::ConfigError { reason: format!("HTTP {status}") };
    }

    if status.is_server_error() {
        warn!(status = %status, "mediation target returned server error");
        return MediationResult::Nack { delay_seconds: 10, reason: "server error".to_string() };
    }

    MediationResult::Nack { delay_seconds: 30, reason: format!("unexpected status {status}") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_common::MediationType;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pointer(target: String) -> MessagePointer {
        MessagePointer {
            id: "app-1".to_string(),
            broker_message_id: Some("broker-1".to_string()),
            pool_code: "pool-a".to_string(),
            auth_token: "secret-token".to_string(),
            mediation_type: MediationType::HTTP,
            mediation_target: target,
            message_group_id: None,
            batch_id: None,
        }
    }

    #[tokio::test]
    async fn success_response_yields_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mediator = HttpMediator::new(Arc::new(CircuitBreakerRegistry::new())).unwrap();
        let result = mediator.mediate(&pointer(format!("{}/hook", server.uri()))).await;
        assert!(matches!(result, MediationResult::Success));
    }

    #[tokio::test]
    async fn bad_request_is_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(400)).mount(&server).await;

        let mediator = HttpMediator::new(Arc::new(CircuitBreakerRegistry::new())).unwrap();
        let result = mediator.mediate(&pointer(server.uri())).await;
        assert!(matches!(result, MediationResult::ConfigError { .. }));
    }

    #[tokio::test]
    async fn other_4xx_is_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(409)).mount(&server).await;

        let mediator = HttpMediator::new(Arc::new(CircuitBreakerRegistry::new())).unwrap();
        let result = mediator.mediate(&pointer(server.uri())).await;
        match result {
            MediationResult::ConfigError { reason } => assert_eq!(reason, "HTTP 409 Conflict"),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_ack_false_body_yields_nack_with_its_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": false, "delaySeconds": 42})))
            .mount(&server)
            .await;

        let mediator = HttpMediator::new(Arc::new(CircuitBreakerRegistry::new())).unwrap();
        let result = mediator.mediate(&pointer(server.uri())).await;
        match result {
            MediationResult::Nack { delay_seconds, reason } => {
                assert_eq!(delay_seconds, 42);
                assert_eq!(reason, "target returned ack=false");
            }
            other => panic!("expected nack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_nack() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let mediator = HttpMediator::new(Arc::new(CircuitBreakerRegistry::new())).unwrap();
        let result = mediator.mediate(&pointer(server.uri())).await;
        assert!(matches!(result, MediationResult::Nack { .. }));
    }

    #[tokio::test]
    async fn too_many_requests_honors_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "17"))
            .mount(&server)
            .await;

        let mediator = HttpMediator::new(Arc::new(CircuitBreakerRegistry::new())).unwrap();
        let result = mediator.mediate(&pointer(server.uri())).await;
        match result {
            MediationResult::Nack { delay_seconds, .. } => assert_eq!(delay_seconds, 17),
            other => panic!("expected nack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_a_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).expect(5).mount(&server).await;

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let mediator = HttpMediator::new(breakers.clone()).unwrap();
        let p = pointer(server.uri());

        for _ in 0..5 {
            mediator.mediate(&p).await;
        }

        // The breaker should now be open; a 6th call must not reach wiremock's
        // strict expectation (`expect(5)` above would fail the mock server otherwise).
        let result = mediator.mediate(&p).await;
        match result {
            MediationResult::Nack { reason, .. } => assert_eq!(reason, "circuit open"),
            other => panic!("expected circuit-open nack, got {other:?}"),
        }
    }
}
