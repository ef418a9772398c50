//! Fire-and-forget audit and reconciliation sink.
//!
//! Dispatch never awaits durability: attempt rows, budget charges, and
//! wallet refunds are handed to a bounded queue drained by one background
//! writer task. Attempt rows are best-effort; a dropped or failed budget
//! charge silently inflates the available budget, so those are counted and
//! logged at error level for monitoring rather than ignored.

use sente_store::LedgerStore;
use sente_types::AttemptRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// One unit of deferred persistence work.
#[derive(Debug)]
pub enum AuditJob {
    Attempt(AttemptRecord),
    BudgetCharge {
        scope: String,
        cost_minor: u64,
        at_unix_ms: u64,
    },
    WalletRefund {
        transaction_id: String,
    },
    Flush(oneshot::Sender<()>),
}

impl AuditJob {
    fn kind(&self) -> &'static str {
        match self {
            Self::Attempt(_) => "attempt",
            Self::BudgetCharge { .. } => "budget_charge",
            Self::WalletRefund { .. } => "wallet_refund",
            Self::Flush(_) => "flush",
        }
    }
}

#[derive(Debug, Default)]
struct AuditSinkMetrics {
    attempts_written: AtomicU64,
    charges_written: AtomicU64,
    refunds_written: AtomicU64,
    attempts_dropped: AtomicU64,
    charges_dropped: AtomicU64,
    refunds_dropped: AtomicU64,
    attempt_write_failures: AtomicU64,
    charge_write_failures: AtomicU64,
    refund_write_failures: AtomicU64,
}

/// Point-in-time copy of the sink counters for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditMetricsSnapshot {
    pub attempts_written: u64,
    pub charges_written: u64,
    pub refunds_written: u64,
    pub attempts_dropped: u64,
    pub charges_dropped: u64,
    pub refunds_dropped: u64,
    pub attempt_write_failures: u64,
    pub charge_write_failures: u64,
    pub refund_write_failures: u64,
}

impl AuditMetricsSnapshot {
    /// True when a reconciliation update was lost; this inflates budgets or
    /// balances and must be surfaced, not absorbed.
    pub fn has_reconciliation_loss(&self) -> bool {
        self.charges_dropped
            .saturating_add(self.charge_write_failures)
            .saturating_add(self.refunds_dropped)
            .saturating_add(self.refund_write_failures)
            > 0
    }
}

/// Handle to the background writer. Cheap to share; dropping every handle
/// ends the writer once the queue drains.
pub struct AuditSink {
    sender: mpsc::Sender<AuditJob>,
    metrics: Arc<AuditSinkMetrics>,
}

impl AuditSink {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn LedgerStore>, queue_limit: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_limit.max(1));
        let metrics = Arc::new(AuditSinkMetrics::default());
        tokio::spawn(drain_jobs(store, receiver, metrics.clone()));
        Self { sender, metrics }
    }

    pub fn record_attempt(&self, record: AttemptRecord) {
        self.enqueue(AuditJob::Attempt(record));
    }

    pub fn record_budget_charge(&self, scope: impl Into<String>, cost_minor: u64, at_unix_ms: u64) {
        self.enqueue(AuditJob::BudgetCharge {
            scope: scope.into(),
            cost_minor,
            at_unix_ms,
        });
    }

    pub fn record_wallet_refund(&self, transaction_id: impl Into<String>) {
        self.enqueue(AuditJob::WalletRefund {
            transaction_id: transaction_id.into(),
        });
    }

    fn enqueue(&self, job: AuditJob) {
        let kind = job.kind();
        if let Err(error) = self.sender.try_send(job) {
            match &error {
                mpsc::error::TrySendError::Full(job) => match job {
                    AuditJob::BudgetCharge { scope, .. } => {
                        self.metrics.charges_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            scope = scope.as_str(),
                            "audit queue full, budget charge dropped; counters now understate spend"
                        );
                    }
                    AuditJob::WalletRefund { transaction_id } => {
                        self.metrics.refunds_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            transaction_id = transaction_id.as_str(),
                            "audit queue full, wallet refund dropped; balance reconciliation required"
                        );
                    }
                    _ => {
                        self.metrics
                            .attempts_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(job_kind = kind, "audit queue full, record dropped");
                    }
                },
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!(job_kind = kind, "audit writer stopped, record dropped");
                }
            }
        }
    }

    /// Queue barrier: resolves once every job enqueued before it has been
    /// applied. Used by tests and orderly shutdown.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(AuditJob::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn metrics(&self) -> AuditMetricsSnapshot {
        AuditMetricsSnapshot {
            attempts_written: self.metrics.attempts_written.load(Ordering::Relaxed),
            charges_written: self.metrics.charges_written.load(Ordering::Relaxed),
            refunds_written: self.metrics.refunds_written.load(Ordering::Relaxed),
            attempts_dropped: self.metrics.attempts_dropped.load(Ordering::Relaxed),
            charges_dropped: self.metrics.charges_dropped.load(Ordering::Relaxed),
            refunds_dropped: self.metrics.refunds_dropped.load(Ordering::Relaxed),
            attempt_write_failures: self.metrics.attempt_write_failures.load(Ordering::Relaxed),
            charge_write_failures: self.metrics.charge_write_failures.load(Ordering::Relaxed),
            refund_write_failures: self.metrics.refund_write_failures.load(Ordering::Relaxed),
        }
    }
}

async fn drain_jobs(
    store: Arc<dyn LedgerStore>,
    mut receiver: mpsc::Receiver<AuditJob>,
    metrics: Arc<AuditSinkMetrics>,
) {
    while let Some(job) = receiver.recv().await {
        match job {
            AuditJob::Attempt(record) => {
                let dispatch_id = record.dispatch_id.clone();
                match store.insert_attempt(record).await {
                    Ok(()) => {
                        metrics.attempts_written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        metrics
                            .attempt_write_failures
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            dispatch_id = dispatch_id.as_str(),
                            error = %error,
                            "attempt audit write failed"
                        );
                    }
                }
            }
            AuditJob::BudgetCharge {
                scope,
                cost_minor,
                at_unix_ms,
            } => match store.apply_budget_charge(&scope, cost_minor, at_unix_ms).await {
                Ok(_) => {
                    metrics.charges_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    metrics
                        .charge_write_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        scope = scope.as_str(),
                        cost_minor,
                        error = %error,
                        "budget charge failed to apply; counters now understate spend"
                    );
                }
            },
            AuditJob::WalletRefund { transaction_id } => {
                match store.refund_withdrawal(&transaction_id).await {
                    Ok(_) => {
                        metrics.refunds_written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        metrics
                            .refund_write_failures
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            transaction_id = transaction_id.as_str(),
                            error = %error,
                            "wallet refund failed to apply; balance reconciliation required"
                        );
                    }
                }
            }
            AuditJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
