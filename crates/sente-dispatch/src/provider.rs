//! Provider contracts and the HTTP-backed email provider client.
//!
//! Vendor-specific request/response shapes are deliberately uniform here:
//! every provider exposes one send operation and reports one message id, so
//! the dispatch loop can treat backends interchangeably through their
//! descriptors.

use async_trait::async_trait;
use sente_types::ProviderDescriptor;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// One rendered message bound for one recipient, shared by every provider
/// attempt within a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEnvelope {
    pub dispatch_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Provider acknowledgement for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
}

/// Failure of a single provider attempt. These never surface to callers
/// individually; the fallback loop absorbs them and reports the aggregate.
#[derive(Debug, Error)]
pub enum ProviderCallError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("attempt timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

/// Uniform send contract over interchangeable notification backends.
#[async_trait]
pub trait DispatchProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    async fn send(&self, envelope: &DispatchEnvelope)
        -> Result<ProviderReceipt, ProviderCallError>;
}

/// Builds a live provider from its descriptor; injected so tests can swap
/// real HTTP clients for mocks.
pub trait ProviderFactory: Send + Sync {
    fn build(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn DispatchProvider>, ProviderCallError>;
}

/// JSON-over-HTTP email provider: posts `{to, subject, body}` to the
/// descriptor's endpoint and expects a message id in the response.
pub struct HttpEmailProvider {
    descriptor: ProviderDescriptor,
    client: reqwest::Client,
}

impl HttpEmailProvider {
    pub fn new(
        descriptor: ProviderDescriptor,
        request_timeout_ms: u64,
    ) -> Result<Self, ProviderCallError> {
        if descriptor.endpoint.trim().is_empty() {
            return Err(ProviderCallError::Misconfigured(format!(
                "provider '{}' has no endpoint",
                descriptor.provider_id
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(request_timeout_ms.max(1)))
            .build()?;
        Ok(Self { descriptor, client })
    }
}

#[async_trait]
impl DispatchProvider for HttpEmailProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(
        &self,
        envelope: &DispatchEnvelope,
    ) -> Result<ProviderReceipt, ProviderCallError> {
        let mut request = self
            .client
            .post(&self.descriptor.endpoint)
            .header("x-sente-dispatch-id", envelope.dispatch_id.as_str())
            .json(&json!({
                "to": envelope.recipient,
                "subject": envelope.subject,
                "body": envelope.body,
            }));
        if let Some(token) = &self.descriptor.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(ProviderCallError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }

        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|error| ProviderCallError::InvalidResponse(error.to_string()))?;
        let message_id = parsed["id"]
            .as_str()
            .or_else(|| parsed["message_id"].as_str())
            .ok_or_else(|| {
                ProviderCallError::InvalidResponse(
                    "response carries no message id".to_string(),
                )
            })?;
        Ok(ProviderReceipt {
            provider_message_id: message_id.to_string(),
        })
    }
}

/// Default factory producing [`HttpEmailProvider`] values with a shared
/// request timeout.
pub struct HttpProviderFactory {
    request_timeout_ms: u64,
}

impl HttpProviderFactory {
    pub fn new(request_timeout_ms: u64) -> Self {
        Self { request_timeout_ms }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn DispatchProvider>, ProviderCallError> {
        Ok(Arc::new(HttpEmailProvider::new(
            descriptor.clone(),
            self.request_timeout_ms,
        )?))
    }
}
