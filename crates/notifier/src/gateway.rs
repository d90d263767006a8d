//! Outbound SMS gateway adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Gateway `messageType` for plain transactional text.
const MESSAGE_TYPE_TEXT: &str = "2";

/// Longest gateway body kept in an error or description.
const MAX_BODY_EXCERPT: usize = 200;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway refused the message; sending it again will not help.
    #[error("gateway rejected message: {0}")]
    Rejected(String),

    /// Network failure, timeout, throttling or a 5xx.
    #[error("gateway unavailable: {0}")]
    Transient(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// One message to send.
#[derive(Debug, Clone)]
pub struct OutboundSms {
    /// Normalized recipient number.
    pub to: String,
    pub message: String,
    pub correlation_id: Uuid,
}

/// The gateway's immediate answer for an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub cost: Option<String>,
    pub description: Option<String>,
    pub provider_message_id: Option<String>,
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, sms: &OutboundSms) -> Result<GatewayReceipt, GatewayError>;
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    from: &'a str,
    to: &'a str,
    message: &'a str,
    #[serde(rename = "refId")]
    ref_id: String,
    #[serde(rename = "messageType")]
    message_type: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayResponse {
    cost: Option<String>,
    #[serde(rename = "msgId")]
    msg_id: Option<String>,
    desc: Option<String>,
    status: Option<String>,
    #[serde(rename = "statusCode")]
    status_code: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

impl GatewayResponse {
    /// Best human-readable explanation the gateway gave.
    fn reason(&self) -> Option<String> {
        self.desc
            .clone()
            .or_else(|| self.error.clone())
            .or_else(|| self.message.clone())
            .or_else(|| self.status.clone())
    }
}

/// HTTP JSON gateway client.
pub struct HttpSmsGateway {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    sender_id: String,
}

impl HttpSmsGateway {
    /// Build a client. Every request is bounded by `timeout`.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        sender_id: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            sender_id: sender_id.into(),
        })
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn send(&self, sms: &OutboundSms) -> Result<GatewayReceipt, GatewayError> {
        let request = GatewayRequest {
            from: &self.sender_id,
            to: &sms.to,
            message: &sms.message,
            ref_id: sms.correlation_id.to_string(),
            message_type: MESSAGE_TYPE_TEXT,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("failed to read response: {}", e)))?;

        tracing::debug!(
            correlation_id = %sms.correlation_id,
            status,
            "Gateway responded"
        );

        classify_response(status, &body)
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(MAX_BODY_EXCERPT).collect()
}

/// Turn a gateway HTTP status and body into a receipt or a classified error.
///
/// - 2xx: accepted. An unreadable 2xx body still counts as accepted, since
///   the message has most likely gone out.
/// - 408, 429, 5xx: transient.
/// - any other status: rejected.
pub fn classify_response(status: u16, body: &str) -> Result<GatewayReceipt, GatewayError> {
    let parsed: Option<GatewayResponse> = serde_json::from_str(body).ok();

    match status {
        200..=299 => Ok(match parsed {
            Some(r) => GatewayReceipt {
                description: r.desc.clone().or_else(|| r.status.clone()),
                cost: r.cost,
                provider_message_id: r.msg_id,
            },
            None => GatewayReceipt {
                description: Some(excerpt(body)),
                ..GatewayReceipt::default()
            },
        }),
        408 | 429 | 500..=599 => {
            let reason = parsed
                .and_then(|r| r.reason())
                .unwrap_or_else(|| format!("HTTP {}", status));
            Err(GatewayError::Transient(reason))
        }
        _ => {
            let reason = match parsed {
                Some(r) => {
                    let code = r.status_code.clone();
                    let text = r.reason().unwrap_or_else(|| format!("HTTP {}", status));
                    match code {
                        Some(code) => format!("{} (status code {})", text, code),
                        None => text,
                    }
                }
                None => format!("HTTP {}: {}", status, excerpt(body)),
            };
            Err(GatewayError::Rejected(reason))
        }
    }
}
