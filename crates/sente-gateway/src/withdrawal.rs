//! Caller-facing withdrawal dispatch service.
//!
//! Balance admission, fee computation, and transaction creation happen as
//! one atomic reserve before the gateway is touched, so the caller always
//! holds a transaction reference once admission succeeds and concurrent
//! near-limit withdrawals can never overdraw a wallet.

use anyhow::{anyhow, Result};

use crate::client::{GatewayError, InitiationRequest, PaymentGateway};
use sente_core::{current_unix_timestamp_ms, new_correlation_id};
use sente_dispatch::{AuditSink, ClockFn, DispatchEventSink};
use sente_ledger::compute_fee;
use sente_store::{LedgerStore, LedgerStoreError};
use sente_types::{
    AttemptOutcome, AttemptRecord, OperationKind, TransactionRecord, TransactionStatus,
    WithdrawalRequest,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunables for the withdrawal path.
#[derive(Debug, Clone)]
pub struct WithdrawalConfig {
    pub initiation_timeout_ms: u64,
    pub audit_queue_limit: usize,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            initiation_timeout_ms: 15_000,
            audit_queue_limit: 256,
        }
    }
}

/// Successful initiation as reported to the caller. `status` is always
/// `processing`: this acknowledges gateway acceptance, not settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalReceipt {
    pub transaction_id: String,
    pub reference: String,
    pub status: TransactionStatus,
    pub fee_minor: u64,
}

/// Caller-visible failures of the withdrawal path.
#[derive(Debug, Error)]
pub enum WithdrawError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no withdrawal fee rule configured for currency '{currency}'")]
    FeeRuleMissing { currency: String },
    #[error("insufficient funds: available {available_minor}, required {required_minor}")]
    InsufficientFunds {
        available_minor: u64,
        required_minor: u64,
    },
    #[error("dispatch reference '{0}' already used")]
    DuplicateReference(String),
    #[error("gateway rejected initiation: {reason}")]
    GatewayRejected { reason: String },
    #[error(transparent)]
    Store(#[from] LedgerStoreError),
}

/// Long-lived withdrawal dispatch service.
pub struct WithdrawalService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    audit: AuditSink,
    config: WithdrawalConfig,
    event_sink: Option<DispatchEventSink>,
    clock: ClockFn,
}

impl WithdrawalService {
    /// Builds the service and spawns its audit writer; must be called from
    /// within a tokio runtime.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: WithdrawalConfig,
    ) -> Result<Self> {
        if config.initiation_timeout_ms == 0 {
            return Err(anyhow!("withdrawal dispatch requires initiation timeout > 0"));
        }
        if config.audit_queue_limit == 0 {
            return Err(anyhow!("withdrawal dispatch requires audit queue limit > 0"));
        }

        Ok(Self {
            audit: AuditSink::spawn(store.clone(), config.audit_queue_limit),
            store,
            gateway,
            config,
            event_sink: None,
            clock: Arc::new(current_unix_timestamp_ms),
        })
    }

    pub fn with_event_sink(mut self, event_sink: DispatchEventSink) -> Self {
        self.event_sink = Some(event_sink);
        self
    }

    /// Audit sink handle, exposed for flush-on-shutdown and monitoring.
    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Dispatches one withdrawal: fee computation, atomic reserve, gateway
    /// initiation, immediate response. The attempt row (and the refund, on
    /// failure) are applied asynchronously after this returns.
    pub async fn dispatch(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalReceipt, WithdrawError> {
        validate_request(&request)?;

        let rule = self
            .store
            .get_fee_rule(OperationKind::Withdrawal, &request.currency)
            .await
            .map_err(|error| match error {
                LedgerStoreError::FeeRuleNotFound { .. } => WithdrawError::FeeRuleMissing {
                    currency: request.currency.clone(),
                },
                other => WithdrawError::Store(other),
            })?;
        let fee_minor = compute_fee(request.amount_minor, &rule);

        let now_unix_ms = (self.clock)();
        let record = TransactionRecord {
            transaction_id: new_correlation_id("txn"),
            account_id: request.account_id.clone(),
            msisdn: request.msisdn.clone(),
            amount_minor: request.amount_minor,
            fee_minor,
            currency: request.currency.clone(),
            reference: request.reference.clone(),
            status: TransactionStatus::Pending,
            notes: None,
            refunded: false,
            created_unix_ms: now_unix_ms,
            updated_unix_ms: now_unix_ms,
        };

        // Admission: duplicate check, balance check, debit, and pending row
        // in one store transaction. Rejection here has zero side effects.
        self.store
            .reserve_withdrawal(&record)
            .await
            .map_err(|error| match error {
                LedgerStoreError::InsufficientFunds {
                    available_minor,
                    required_minor,
                } => WithdrawError::InsufficientFunds {
                    available_minor,
                    required_minor,
                },
                LedgerStoreError::DuplicateReference(reference) => {
                    WithdrawError::DuplicateReference(reference)
                }
                other => WithdrawError::Store(other),
            })?;

        let initiation = InitiationRequest {
            msisdn: request.msisdn.clone(),
            amount_minor: request.amount_minor,
            currency: request.currency.clone(),
            reference: request.reference.clone(),
        };
        let outcome = tokio::time::timeout(
            Duration::from_millis(self.config.initiation_timeout_ms.max(1)),
            self.gateway.initiate(&initiation),
        )
        .await
        .unwrap_or_else(|_| {
            Err(GatewayError::InvalidResponse(format!(
                "initiation timed out after {}ms",
                self.config.initiation_timeout_ms
            )))
        });

        match outcome {
            Ok(acceptance) => {
                let update = self
                    .store
                    .update_transaction_status(
                        &record.reference,
                        TransactionStatus::Processing,
                        None,
                        (self.clock)(),
                    )
                    .await?;
                self.audit.record_attempt(AttemptRecord {
                    attempt_id: new_correlation_id("att"),
                    dispatch_id: record.reference.clone(),
                    provider_id: self.gateway.gateway_id().to_string(),
                    outcome: AttemptOutcome::Sent,
                    cost_minor: fee_minor,
                    provider_message_id: Some(acceptance.gateway_reference.clone()),
                    error_detail: None,
                    created_unix_ms: (self.clock)(),
                });
                self.emit_event(serde_json::json!({
                    "type": "withdrawal_initiated",
                    "transaction_id": update.record.transaction_id.as_str(),
                    "reference": record.reference.as_str(),
                    "gateway_reference": acceptance.gateway_reference.as_str(),
                    "amount_minor": record.amount_minor,
                    "fee_minor": fee_minor,
                }));
                Ok(WithdrawalReceipt {
                    transaction_id: update.record.transaction_id,
                    reference: record.reference,
                    status: TransactionStatus::Processing,
                    fee_minor,
                })
            }
            Err(error) => {
                let reason = match &error {
                    GatewayError::Rejected { reason } => reason.clone(),
                    other => other.to_string(),
                };
                // The transaction already exists; record the cause and hand
                // the reserved amount back asynchronously.
                self.store
                    .update_transaction_status(
                        &record.reference,
                        TransactionStatus::Failed,
                        Some(reason.clone()),
                        (self.clock)(),
                    )
                    .await?;
                self.audit.record_attempt(AttemptRecord {
                    attempt_id: new_correlation_id("att"),
                    dispatch_id: record.reference.clone(),
                    provider_id: self.gateway.gateway_id().to_string(),
                    outcome: AttemptOutcome::Failed,
                    cost_minor: 0,
                    provider_message_id: None,
                    error_detail: Some(reason.clone()),
                    created_unix_ms: (self.clock)(),
                });
                self.audit
                    .record_wallet_refund(record.transaction_id.clone());
                self.emit_event(serde_json::json!({
                    "type": "withdrawal_initiation_failed",
                    "transaction_id": record.transaction_id.as_str(),
                    "reference": record.reference.as_str(),
                    "reason": reason.as_str(),
                }));
                Err(WithdrawError::GatewayRejected { reason })
            }
        }
    }

    fn emit_event(&self, event: serde_json::Value) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }
}

fn validate_request(request: &WithdrawalRequest) -> Result<(), WithdrawError> {
    if request.account_id.trim().is_empty() {
        return Err(WithdrawError::InvalidRequest(
            "account id must not be empty".to_string(),
        ));
    }
    if request.msisdn.trim().is_empty() {
        return Err(WithdrawError::InvalidRequest(
            "msisdn must not be empty".to_string(),
        ));
    }
    if request.amount_minor == 0 {
        return Err(WithdrawError::InvalidRequest(
            "amount must be positive".to_string(),
        ));
    }
    if request.currency.trim().is_empty() {
        return Err(WithdrawError::InvalidRequest(
            "currency must not be empty".to_string(),
        ));
    }
    if request.reference.trim().is_empty() {
        return Err(WithdrawError::InvalidRequest(
            "reference must not be empty".to_string(),
        ));
    }
    Ok(())
}
