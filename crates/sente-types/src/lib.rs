//! Shared data types for the Sente outbound dispatch engine.
//!
//! All money values are integer minor units; percentages are basis points so
//! fee math stays integral end to end.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from:?} -> {to:?}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Operation family a dispatch belongs to, used to key fee rules and audit
/// correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Notification,
    Withdrawal,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::Withdrawal => "withdrawal",
        }
    }
}

/// Backend family a provider row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Email,
    Payout,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Payout => "payout",
        }
    }
}

/// Immutable per-provider configuration loaded from the durable store.
///
/// Rows are read-only inputs to dispatch; nothing in the engine mutates a
/// descriptor after load. `priority` ascends, lowest tried first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderDescriptor {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub priority: u32,
    pub unit_cost_minor: u64,
    pub enabled: bool,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Vendor-specific connection extras, opaque to the engine.
    #[serde(default)]
    pub params: Value,
}

/// Logical message template resolved by the notification path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageTemplate {
    pub message_kind: String,
    pub subject: String,
    pub body: String,
}

/// Fee rule for one `(operation kind, currency)` pair.
///
/// `fee = clamp(amount * percent_bps / 10_000 + flat, min, max)`; min is
/// applied before max, so a misconfigured `min > max` resolves to `max`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeRule {
    pub percent_bps: u32,
    pub flat_minor: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_minor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_minor: Option<u64>,
}

/// Mutable spend/count aggregate for one budget scope.
///
/// Counters are monotonically non-decreasing within a period bucket; the
/// store rolls `day_key`/`month_key` forward when a charge lands in a new
/// period. A limit of `0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetState {
    pub scope: String,
    pub spent_to_date: u64,
    pub count_today: u64,
    pub count_this_month: u64,
    pub limit_total: u64,
    pub limit_per_day: u64,
    pub limit_per_month: u64,
    pub day_key: String,
    pub month_key: String,
}

impl BudgetState {
    /// Fresh scope with the given limits and zeroed counters.
    pub fn with_limits(
        scope: impl Into<String>,
        limit_total: u64,
        limit_per_day: u64,
        limit_per_month: u64,
    ) -> Self {
        Self {
            scope: scope.into(),
            spent_to_date: 0,
            count_today: 0,
            count_this_month: 0,
            limit_total,
            limit_per_day,
            limit_per_month,
            day_key: String::new(),
            month_key: String::new(),
        }
    }
}

/// Wallet balance for one account, mutated only through atomic reserve and
/// refund operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletState {
    pub account_id: String,
    pub available_balance_minor: u64,
}

/// One notification dispatch request, created per incoming call and never
/// mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRequest {
    pub message_kind: String,
    pub recipient: String,
    #[serde(default)]
    pub placeholders: HashMap<String, String>,
    pub scope: String,
    /// Caller-supplied idempotency key; repeated dispatch with the same
    /// reference is rejected, not re-executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// One withdrawal dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub account_id: String,
    pub msisdn: String,
    pub amount_minor: u64,
    pub currency: String,
    /// Required idempotency key; becomes the transaction's external
    /// reference.
    pub reference: String,
}

/// Outcome of one provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// Append-only audit row for one provider attempt within one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub dispatch_id: String,
    pub provider_id: String,
    pub outcome: AttemptOutcome,
    pub cost_minor: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_unix_ms: u64,
}

/// Lifecycle state for a financial transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransactionStatus {
    /// Returns true when this status can transition to `next`.
    ///
    /// Self-transition is always allowed so duplicate settlement callbacks
    /// are no-ops rather than anomalies.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "transaction_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    /// Returns true when no further state change is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Account-visible financial transaction with a lifecycle state machine.
///
/// Created synchronously when a withdrawal is admitted so the caller always
/// holds a reference, even when downstream settlement fails later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub account_id: String,
    pub msisdn: String,
    pub amount_minor: u64,
    pub fee_minor: u64,
    pub currency: String,
    /// External reference; unique across transactions and the settlement
    /// callback key.
    pub reference: String,
    pub status: TransactionStatus,
    /// Admin-facing notes recording failure causes and settlement detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Set once when the reserved amount has been credited back.
    #[serde(default)]
    pub refunded: bool,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

impl TransactionRecord {
    /// Total amount reserved against the wallet for this transaction.
    pub fn reserved_minor(&self) -> u64 {
        self.amount_minor.saturating_add(self.fee_minor)
    }
}
