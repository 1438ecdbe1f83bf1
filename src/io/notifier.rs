//! Outbound notifications to operators and customers
//!
//! Operators receive the hail on their configured endpoint and must answer
//! with a 2xx JSON body. Customer notifications are fire-and-forget.

use crate::domain::hail::{Hail, HailEvent};
use crate::domain::types::OperatorId;
use crate::infra::config::{Config, OperatorConfig};
use anyhow::Context;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotifyError {
    #[error("operator {0} has no hail endpoint")]
    NoEndpoint(OperatorId),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected status code {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// What an operator returned when accepting a hail
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorAck {
    pub taxi_phone_number: Option<String>,
}

#[async_trait]
pub trait HailNotifier: Send + Sync {
    /// Hand the hail to its operator
    async fn send_to_operator(&self, hail: &Hail) -> Result<OperatorAck, NotifyError>;

    /// Tell the customer about a status change
    async fn notify_customer(&self, event: &HailEvent) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    data: [&'a T; 1],
}

/// POSTs JSON to operator endpoints and the customer webhook
pub struct HttpNotifier {
    client: reqwest::Client,
    operators: FxHashMap<OperatorId, OperatorConfig>,
    customer_webhook_url: Option<String>,
}

impl HttpNotifier {
    pub fn new(
        timeout: Duration,
        operators: FxHashMap<OperatorId, OperatorConfig>,
        customer_webhook_url: Option<String>,
    ) -> anyhow::Result<Self> {
        // One client for connection pooling
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, operators, customer_webhook_url })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            Duration::from_millis(config.notify_timeout_ms()),
            config.operators().clone(),
            config.customer_webhook_url().map(str::to_string),
        )
    }
}

#[async_trait]
impl HailNotifier for HttpNotifier {
    async fn send_to_operator(&self, hail: &Hail) -> Result<OperatorAck, NotifyError> {
        let operator = self.operators.get(hail.operator_id());
        let Some(endpoint) = operator.and_then(|op| op.hail_endpoint.as_deref()) else {
            return Err(NotifyError::NoEndpoint(hail.operator_id().clone()));
        };

        let mut request = self.client.post(endpoint).json(&Envelope { data: [hail] });
        if let Some(op) = operator {
            if let Some(key) = op.api_key.as_deref() {
                let header = op.api_key_header.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER);
                request = request.header(header, key);
            }
        }

        let response = request.send().await.map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        let body: serde_json::Value =
            response.json().await.map_err(|e| NotifyError::InvalidResponse(e.to_string()))?;
        Ok(parse_operator_ack(&body))
    }

    async fn notify_customer(&self, event: &HailEvent) -> Result<(), NotifyError> {
        let Some(url) = self.customer_webhook_url.as_deref() else {
            return Ok(());
        };
        let response = self
            .client
            .post(url)
            .json(&Envelope { data: [event] })
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        debug!(hail_id = %event.hail_id, to = %event.to, "customer_notified");
        Ok(())
    }
}

/// Pull the taxi phone number out of `{"data": [{"taxi_phone_number": ...}]}`
fn parse_operator_ack(body: &serde_json::Value) -> OperatorAck {
    let taxi_phone_number = body
        .get("data")
        .and_then(|data| data.get(0))
        .and_then(|hail| hail.get("taxi_phone_number"))
        .and_then(|phone| phone.as_str())
        .filter(|phone| !phone.is_empty())
        .map(str::to_string);
    OperatorAck { taxi_phone_number }
}

/// Logs instead of sending; operators always acknowledge
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl HailNotifier for LogNotifier {
    async fn send_to_operator(&self, hail: &Hail) -> Result<OperatorAck, NotifyError> {
        info!(hail_id = %hail.id(), operator = %hail.operator_id(), taxi_id = %hail.taxi_id(), "operator_request_logged");
        Ok(OperatorAck::default())
    }

    async fn notify_customer(&self, event: &HailEvent) -> Result<(), NotifyError> {
        info!(hail_id = %event.hail_id, customer_id = %event.customer_id, to = %event.to, "customer_notification_logged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operator_ack() {
        let ack = parse_operator_ack(&json!({"data": [{"taxi_phone_number": "+33123456789"}]}));
        assert_eq!(ack.taxi_phone_number.as_deref(), Some("+33123456789"));

        assert_eq!(parse_operator_ack(&json!({"data": []})), OperatorAck::default());
        assert_eq!(parse_operator_ack(&json!({"data": [{"taxi_phone_number": ""}]})), OperatorAck::default());
        assert_eq!(parse_operator_ack(&json!("ok")), OperatorAck::default());
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        use crate::domain::hail::NewHail;
        use crate::domain::types::{Actor, CustomerId, GeoPoint, HailId, SessionId, TaxiId};

        let notifier = HttpNotifier::new(Duration::from_millis(100), FxHashMap::default(), None).unwrap();
        let hail = Hail::new(
            HailId::from("h1"),
            NewHail {
                taxi_id: TaxiId::from("t1"),
                operator_id: OperatorId::from("op"),
                customer_id: CustomerId::from("c1"),
                session_id: SessionId::from("s1"),
                pickup: GeoPoint::new(48.85, 2.35).unwrap(),
                initial_taxi_position: None,
            },
            Actor::System,
            0,
        );
        let err = notifier.send_to_operator(&hail).await.unwrap_err();
        assert_eq!(err, NotifyError::NoEndpoint(OperatorId::from("op")));
    }

    #[test]
    fn test_envelope_shape() {
        let value = json!({"a": 1});
        let encoded = serde_json::to_value(Envelope { data: [&value] }).unwrap();
        assert_eq!(encoded, json!({"data": [{"a": 1}]}));
    }
}
