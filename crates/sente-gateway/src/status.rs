//! Settlement status tracker.
//!
//! A separate consumer of out-of-band gateway confirmations (webhook or
//! poll), keyed by the transaction's external reference. Duplicate callbacks
//! are safe; out-of-order updates are logged and refused, never applied.

use sente_core::current_unix_timestamp_ms;
use sente_dispatch::{AuditSink, ClockFn, DispatchEventSink};
use sente_store::{LedgerStore, LedgerStoreError};
use sente_types::{TransactionRecord, TransactionStatus};
use std::sync::Arc;
use thiserror::Error;

/// Final settlement outcome reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Completed,
    Failed { reason: String },
}

impl SettlementOutcome {
    fn target_status(&self) -> TransactionStatus {
        match self {
            Self::Completed => TransactionStatus::Completed,
            Self::Failed { .. } => TransactionStatus::Failed,
        }
    }
}

/// Result of applying one settlement callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementApplied {
    /// The transaction moved to its terminal state now.
    Applied(TransactionRecord),
    /// The transaction was already in the reported state; nothing changed.
    AlreadyApplied(TransactionRecord),
}

impl SettlementApplied {
    pub fn record(&self) -> &TransactionRecord {
        match self {
            Self::Applied(record) | Self::AlreadyApplied(record) => record,
        }
    }
}

/// Failures of the settlement path.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),
    #[error("anomalous transition for '{reference}': {from:?} -> {to:?}")]
    AnomalousTransition {
        reference: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error(transparent)]
    Store(#[from] LedgerStoreError),
}

/// Applies settlement callbacks and answers status queries. Runs entirely
/// outside the dispatch path and never blocks new withdrawals.
pub struct StatusTracker {
    store: Arc<dyn LedgerStore>,
    audit: AuditSink,
    event_sink: Option<DispatchEventSink>,
    clock: ClockFn,
}

impl StatusTracker {
    /// Builds the tracker and spawns its reconciliation writer; must be
    /// called from within a tokio runtime.
    pub fn new(store: Arc<dyn LedgerStore>, audit_queue_limit: usize) -> Self {
        Self {
            audit: AuditSink::spawn(store.clone(), audit_queue_limit),
            store,
            event_sink: None,
            clock: Arc::new(current_unix_timestamp_ms),
        }
    }

    pub fn with_event_sink(mut self, event_sink: DispatchEventSink) -> Self {
        self.event_sink = Some(event_sink);
        self
    }

    /// Reconciliation sink handle, exposed for flush-on-shutdown and
    /// monitoring.
    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Applies one settlement callback idempotently. Re-reporting the state
    /// a transaction already holds is a no-op; an illegal transition (for
    /// example any update to a `completed` row) is logged as an anomaly and
    /// not applied. A failed settlement hands the reserved amount back
    /// exactly once.
    pub async fn apply_settlement(
        &self,
        reference: &str,
        outcome: SettlementOutcome,
    ) -> Result<SettlementApplied, StatusError> {
        let current = self
            .store
            .get_transaction_by_reference(reference)
            .await
            .map_err(|error| match error {
                LedgerStoreError::TransactionNotFound(reference) => {
                    StatusError::TransactionNotFound(reference)
                }
                other => StatusError::Store(other),
            })?;

        let target = outcome.target_status();
        if current.status == target {
            return Ok(SettlementApplied::AlreadyApplied(current));
        }
        if !current.status.can_transition_to(target) {
            tracing::warn!(
                reference,
                from = current.status.as_str(),
                to = target.as_str(),
                "anomalous settlement transition refused"
            );
            self.emit_event(serde_json::json!({
                "type": "settlement_anomaly",
                "reference": reference,
                "from": current.status.as_str(),
                "to": target.as_str(),
            }));
            return Err(StatusError::AnomalousTransition {
                reference: reference.to_string(),
                from: current.status,
                to: target,
            });
        }

        let notes = match &outcome {
            SettlementOutcome::Completed => None,
            SettlementOutcome::Failed { reason } => Some(reason.clone()),
        };
        let update = self
            .store
            .update_transaction_status(reference, target, notes, (self.clock)())
            .await?;

        if matches!(outcome, SettlementOutcome::Failed { .. }) {
            self.audit
                .record_wallet_refund(update.record.transaction_id.clone());
        }
        self.emit_event(serde_json::json!({
            "type": "settlement_applied",
            "reference": reference,
            "status": target.as_str(),
        }));
        Ok(SettlementApplied::Applied(update.record))
    }

    /// Latest state-machine value for a transaction, as seen by UI callers.
    pub async fn get_status(
        &self,
        transaction_id: &str,
    ) -> Result<TransactionRecord, StatusError> {
        self.store
            .get_transaction(transaction_id)
            .await
            .map_err(|error| match error {
                LedgerStoreError::TransactionNotFound(id) => StatusError::TransactionNotFound(id),
                other => StatusError::Store(other),
            })
    }

    fn emit_event(&self, event: serde_json::Value) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sente_store::InMemoryLedgerStore;
    use sente_types::WalletState;
    use serde_json::Value;
    use std::sync::Mutex;

    async fn store_with_processing_transaction() -> (Arc<InMemoryLedgerStore>, String) {
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .upsert_wallet(WalletState {
                account_id: "acct-1".to_string(),
                available_balance_minor: 10_000,
            })
            .await
            .expect("seed wallet");
        let record = TransactionRecord {
            transaction_id: "txn-1".to_string(),
            account_id: "acct-1".to_string(),
            msisdn: "+256700000001".to_string(),
            amount_minor: 9_000,
            fee_minor: 500,
            currency: "UGX".to_string(),
            reference: "wd-1".to_string(),
            status: TransactionStatus::Pending,
            notes: None,
            refunded: false,
            created_unix_ms: 1_000,
            updated_unix_ms: 1_000,
        };
        store.reserve_withdrawal(&record).await.expect("reserve");
        store
            .update_transaction_status("wd-1", TransactionStatus::Processing, None, 2_000)
            .await
            .expect("processing");
        (store, "wd-1".to_string())
    }

    #[tokio::test]
    async fn functional_completion_applies_once_and_replays_as_noop() {
        let (store, reference) = store_with_processing_transaction().await;
        let tracker = StatusTracker::new(store.clone(), 16);

        let first = tracker
            .apply_settlement(&reference, SettlementOutcome::Completed)
            .await
            .expect("first callback");
        assert!(matches!(first, SettlementApplied::Applied(_)));
        assert_eq!(first.record().status, TransactionStatus::Completed);

        let wallet_after_first = store
            .get_wallet("acct-1")
            .await
            .expect("wallet")
            .available_balance_minor;

        let replay = tracker
            .apply_settlement(&reference, SettlementOutcome::Completed)
            .await
            .expect("duplicate callback");
        assert!(matches!(replay, SettlementApplied::AlreadyApplied(_)));

        tracker.audit().flush().await;
        // Identical records and balance after the duplicate: no double
        // credit or debit.
        assert_eq!(replay.record(), first.record());
        assert_eq!(
            store
                .get_wallet("acct-1")
                .await
                .expect("wallet")
                .available_balance_minor,
            wallet_after_first
        );
    }

    #[tokio::test]
    async fn functional_failed_settlement_refunds_exactly_once() {
        let (store, reference) = store_with_processing_transaction().await;
        let tracker = StatusTracker::new(store.clone(), 16);

        let applied = tracker
            .apply_settlement(
                &reference,
                SettlementOutcome::Failed {
                    reason: "recipient wallet closed".to_string(),
                },
            )
            .await
            .expect("failure callback");
        assert_eq!(applied.record().status, TransactionStatus::Failed);
        assert_eq!(
            applied.record().notes.as_deref(),
            Some("recipient wallet closed")
        );

        // Duplicate failure callback: no-op, no second refund.
        tracker
            .apply_settlement(
                &reference,
                SettlementOutcome::Failed {
                    reason: "recipient wallet closed".to_string(),
                },
            )
            .await
            .expect("duplicate failure callback");

        tracker.audit().flush().await;
        assert_eq!(
            store
                .get_wallet("acct-1")
                .await
                .expect("wallet")
                .available_balance_minor,
            10_000
        );
    }

    #[tokio::test]
    async fn regression_completed_to_failed_is_refused_and_logged() {
        let (store, reference) = store_with_processing_transaction().await;
        let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let events_sink = events.clone();
        let tracker = StatusTracker::new(store.clone(), 16).with_event_sink(Arc::new(
            move |event| events_sink.lock().expect("events lock").push(event),
        ));

        tracker
            .apply_settlement(&reference, SettlementOutcome::Completed)
            .await
            .expect("complete");
        let error = tracker
            .apply_settlement(
                &reference,
                SettlementOutcome::Failed {
                    reason: "late reversal".to_string(),
                },
            )
            .await
            .expect_err("completed -> failed is anomalous");
        assert!(matches!(
            error,
            StatusError::AnomalousTransition {
                from: TransactionStatus::Completed,
                to: TransactionStatus::Failed,
                ..
            }
        ));

        // Not applied: the record still reads completed, and the anomaly
        // was emitted for monitoring.
        let record = tracker.get_status("txn-1").await.expect("status");
        assert_eq!(record.status, TransactionStatus::Completed);
        let events = events.lock().expect("events lock");
        assert!(events
            .iter()
            .any(|event| event["type"] == "settlement_anomaly"));
    }

    #[tokio::test]
    async fn unit_unknown_reference_is_typed() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tracker = StatusTracker::new(store, 16);
        let error = tracker
            .apply_settlement("missing", SettlementOutcome::Completed)
            .await
            .expect_err("unknown reference");
        assert!(matches!(error, StatusError::TransactionNotFound(_)));
    }
}
