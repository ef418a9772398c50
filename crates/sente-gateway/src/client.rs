//! Payment gateway client contract and its HTTP implementation.
//!
//! The gateway is singular in this design but still sits behind a trait so
//! the withdrawal service can be exercised without network access.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Connection settings for the hosted mobile-money gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_id: String,
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: "mobile-money".to_string(),
            api_base: "https://gateway.example/api/v1".to_string(),
            api_key: String::new(),
            request_timeout_ms: 15_000,
        }
    }
}

/// Initiation failures. `Rejected` is a business refusal; everything else is
/// transport-level.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("gateway rejected initiation: {reason}")]
    Rejected { reason: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One payout initiation handed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiationRequest {
    pub msisdn: String,
    pub amount_minor: u64,
    pub currency: String,
    pub reference: String,
}

/// Gateway acknowledgement that the payout was accepted for processing.
/// Settlement confirmation arrives out-of-band later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAcceptance {
    pub gateway_reference: String,
}

/// Contract for initiating payouts against the external gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn gateway_id(&self) -> &str;

    async fn initiate(
        &self,
        request: &InitiationRequest,
    ) -> Result<GatewayAcceptance, GatewayError>;
}

/// JSON-over-HTTP gateway client posting to `<api_base>/payouts`.
pub struct HttpPaymentGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.api_key.trim().is_empty() {
            return Err(GatewayError::MissingApiKey);
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;
        Ok(Self { config, client })
    }

    fn payouts_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{base}/payouts")
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn gateway_id(&self) -> &str {
        &self.config.gateway_id
    }

    async fn initiate(
        &self,
        request: &InitiationRequest,
    ) -> Result<GatewayAcceptance, GatewayError> {
        let response = self
            .client
            .post(self.payouts_url())
            .bearer_auth(self.config.api_key.trim())
            .json(&json!({
                "msisdn": request.msisdn,
                "amount": request.amount_minor,
                "currency": request.currency,
                "reference": request.reference,
            }))
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            // 4xx carries the gateway's refusal reason; treat it as a
            // business rejection rather than a transport fault.
            if status.is_client_error() {
                let reason = parse_rejection_reason(&raw)
                    .unwrap_or_else(|| format!("status {}: {raw}", status.as_u16()));
                return Err(GatewayError::Rejected { reason });
            }
            return Err(GatewayError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }

        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|error| GatewayError::InvalidResponse(error.to_string()))?;
        match parsed["status"].as_str() {
            Some("accepted") => {
                let gateway_reference = parsed["gateway_reference"]
                    .as_str()
                    .ok_or_else(|| {
                        GatewayError::InvalidResponse(
                            "accepted response carries no gateway reference".to_string(),
                        )
                    })?
                    .to_string();
                Ok(GatewayAcceptance { gateway_reference })
            }
            Some("rejected") => Err(GatewayError::Rejected {
                reason: parsed["reason"]
                    .as_str()
                    .unwrap_or("no reason given")
                    .to_string(),
            }),
            other => Err(GatewayError::InvalidResponse(format!(
                "unexpected initiation status {other:?}"
            ))),
        }
    }
}

fn parse_rejection_reason(raw: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(raw).ok()?;
    parsed["reason"]
        .as_str()
        .or_else(|| parsed["message"].as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_missing_api_key_is_rejected_at_construction() {
        let error = HttpPaymentGateway::new(GatewayConfig::default())
            .err()
            .expect("blank key must fail");
        assert!(matches!(error, GatewayError::MissingApiKey));
    }

    #[test]
    fn unit_payouts_url_tolerates_trailing_slash() {
        let gateway = HttpPaymentGateway::new(GatewayConfig {
            api_key: "key".to_string(),
            api_base: "https://gateway.example/api/v1/".to_string(),
            ..GatewayConfig::default()
        })
        .expect("gateway");
        assert_eq!(
            gateway.payouts_url(),
            "https://gateway.example/api/v1/payouts"
        );
    }

    #[test]
    fn unit_rejection_reason_parses_common_shapes() {
        assert_eq!(
            parse_rejection_reason(r#"{"reason":"no phone number on file"}"#),
            Some("no phone number on file".to_string())
        );
        assert_eq!(
            parse_rejection_reason(r#"{"message":"limit exceeded"}"#),
            Some("limit exceeded".to_string())
        );
        assert_eq!(parse_rejection_reason("not json"), None);
    }
}
