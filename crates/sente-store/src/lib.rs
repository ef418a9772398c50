//! Durable store abstractions and in-memory backend for the dispatch engine.
//!
//! The store owns CapState (budgets and wallets), provider and template
//! configuration, transactions, and the attempt audit trail. Budget charges
//! serialize per scope; balance admission and debit are one atomic unit so
//! two concurrent near-limit withdrawals can never both be admitted.

use async_trait::async_trait;
use sente_core::{day_key, month_key};
use sente_types::{
    AttemptRecord, BudgetState, FeeRule, MessageTemplate, OperationKind, ProviderDescriptor,
    ProviderKind, StatusTransitionError, TransactionRecord, TransactionStatus, WalletState,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteLedgerStore;

/// Result type for ledger store operations.
pub type StoreResult<T> = Result<T, LedgerStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("budget scope '{0}' not found")]
    ScopeNotFound(String),
    #[error("wallet for account '{0}' not found")]
    WalletNotFound(String),
    #[error("provider '{0}' not found")]
    ProviderNotFound(String),
    #[error("template '{0}' not found")]
    TemplateNotFound(String),
    #[error("no fee rule for {operation}/{currency}")]
    FeeRuleNotFound {
        operation: &'static str,
        currency: String,
    },
    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),
    #[error("dispatch reference '{0}' already used")]
    DuplicateReference(String),
    #[error("insufficient funds: available {available_minor}, required {required_minor}")]
    InsufficientFunds {
        available_minor: u64,
        required_minor: u64,
    },
    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of a transaction status update; `changed` is false when the row
/// already held the target status (idempotent settlement re-apply).
#[derive(Debug, Clone)]
pub struct TransactionUpdate {
    pub record: TransactionRecord,
    pub changed: bool,
}

/// Async store contract used by the dispatch and settlement services.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_budget(&self, scope: &str) -> StoreResult<BudgetState>;
    async fn upsert_budget(&self, state: BudgetState) -> StoreResult<()>;
    /// Applies one admitted dispatch's cost to a scope: rolls the day/month
    /// buckets forward when the charge lands in a new period, then bumps
    /// spend and both counters. Serialized per scope.
    async fn apply_budget_charge(
        &self,
        scope: &str,
        cost_minor: u64,
        now_unix_ms: u64,
    ) -> StoreResult<BudgetState>;

    async fn get_wallet(&self, account_id: &str) -> StoreResult<WalletState>;
    async fn upsert_wallet(&self, wallet: WalletState) -> StoreResult<()>;

    /// Single atomic unit backing withdrawal admission: rejects a duplicate
    /// reference, checks the balance against `amount + fee`, debits the
    /// wallet, and inserts the `pending` transaction row.
    async fn reserve_withdrawal(&self, record: &TransactionRecord) -> StoreResult<()>;
    /// Credits the reserved amount back exactly once; returns false when the
    /// transaction was already refunded.
    async fn refund_withdrawal(&self, transaction_id: &str) -> StoreResult<bool>;
    async fn get_transaction(&self, transaction_id: &str) -> StoreResult<TransactionRecord>;
    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> StoreResult<TransactionRecord>;
    /// Validates the transition, then applies it. Updating a row to the
    /// status it already holds is a no-op that leaves the record untouched.
    async fn update_transaction_status(
        &self,
        reference: &str,
        status: TransactionStatus,
        notes: Option<String>,
        now_unix_ms: u64,
    ) -> StoreResult<TransactionUpdate>;

    /// Providers of one kind, priority ascending, enabled and disabled both.
    async fn list_providers(&self, kind: ProviderKind) -> StoreResult<Vec<ProviderDescriptor>>;
    async fn upsert_provider(&self, descriptor: ProviderDescriptor) -> StoreResult<()>;
    async fn set_provider_enabled(&self, provider_id: &str, enabled: bool) -> StoreResult<()>;

    async fn get_template(&self, message_kind: &str) -> StoreResult<MessageTemplate>;
    async fn upsert_template(&self, template: MessageTemplate) -> StoreResult<()>;

    async fn get_fee_rule(&self, kind: OperationKind, currency: &str) -> StoreResult<FeeRule>;
    async fn upsert_fee_rule(
        &self,
        kind: OperationKind,
        currency: &str,
        rule: FeeRule,
    ) -> StoreResult<()>;

    async fn insert_attempt(&self, record: AttemptRecord) -> StoreResult<()>;
    async fn list_attempts(&self, dispatch_id: &str) -> StoreResult<Vec<AttemptRecord>>;

    /// Claims a caller-supplied idempotency reference; first caller wins.
    async fn register_dispatch(&self, reference: &str) -> StoreResult<()>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    budgets: HashMap<String, BudgetState>,
    wallets: HashMap<String, WalletState>,
    providers: HashMap<String, ProviderDescriptor>,
    templates: HashMap<String, MessageTemplate>,
    fee_rules: HashMap<(OperationKind, String), FeeRule>,
    transactions: HashMap<String, TransactionRecord>,
    transaction_ids_by_reference: HashMap<String, String>,
    attempts: Vec<AttemptRecord>,
    dispatch_refs: HashSet<String>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn roll_budget_period(state: &mut BudgetState, now_unix_ms: u64) {
    let today = day_key(now_unix_ms);
    if state.day_key != today {
        state.day_key = today;
        state.count_today = 0;
    }
    let this_month = month_key(now_unix_ms);
    if state.month_key != this_month {
        state.month_key = this_month;
        state.count_this_month = 0;
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_budget(&self, scope: &str) -> StoreResult<BudgetState> {
        let inner = self.inner.read().await;
        inner
            .budgets
            .get(scope)
            .cloned()
            .ok_or_else(|| LedgerStoreError::ScopeNotFound(scope.to_string()))
    }

    async fn upsert_budget(&self, state: BudgetState) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.budgets.insert(state.scope.clone(), state);
        Ok(())
    }

    async fn apply_budget_charge(
        &self,
        scope: &str,
        cost_minor: u64,
        now_unix_ms: u64,
    ) -> StoreResult<BudgetState> {
        let mut inner = self.inner.write().await;
        let state = inner
            .budgets
            .get_mut(scope)
            .ok_or_else(|| LedgerStoreError::ScopeNotFound(scope.to_string()))?;
        roll_budget_period(state, now_unix_ms);
        state.spent_to_date = state.spent_to_date.saturating_add(cost_minor);
        state.count_today = state.count_today.saturating_add(1);
        state.count_this_month = state.count_this_month.saturating_add(1);
        Ok(state.clone())
    }

    async fn get_wallet(&self, account_id: &str) -> StoreResult<WalletState> {
        let inner = self.inner.read().await;
        inner
            .wallets
            .get(account_id)
            .cloned()
            .ok_or_else(|| LedgerStoreError::WalletNotFound(account_id.to_string()))
    }

    async fn upsert_wallet(&self, wallet: WalletState) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.wallets.insert(wallet.account_id.clone(), wallet);
        Ok(())
    }

    async fn reserve_withdrawal(&self, record: &TransactionRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;

        if inner
            .transaction_ids_by_reference
            .contains_key(&record.reference)
        {
            return Err(LedgerStoreError::DuplicateReference(
                record.reference.clone(),
            ));
        }

        let required_minor = record.reserved_minor();
        let wallet = inner
            .wallets
            .get_mut(&record.account_id)
            .ok_or_else(|| LedgerStoreError::WalletNotFound(record.account_id.clone()))?;
        if required_minor > wallet.available_balance_minor {
            return Err(LedgerStoreError::InsufficientFunds {
                available_minor: wallet.available_balance_minor,
                required_minor,
            });
        }
        wallet.available_balance_minor -= required_minor;

        inner
            .transaction_ids_by_reference
            .insert(record.reference.clone(), record.transaction_id.clone());
        inner
            .transactions
            .insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn refund_withdrawal(&self, transaction_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let (account_id, reserved_minor) = {
            let record = inner
                .transactions
                .get_mut(transaction_id)
                .ok_or_else(|| LedgerStoreError::TransactionNotFound(transaction_id.to_string()))?;
            if record.refunded {
                return Ok(false);
            }
            record.refunded = true;
            (record.account_id.clone(), record.reserved_minor())
        };

        let wallet = inner
            .wallets
            .get_mut(&account_id)
            .ok_or_else(|| LedgerStoreError::WalletNotFound(account_id.clone()))?;
        wallet.available_balance_minor =
            wallet.available_balance_minor.saturating_add(reserved_minor);
        Ok(true)
    }

    async fn get_transaction(&self, transaction_id: &str) -> StoreResult<TransactionRecord> {
        let inner = self.inner.read().await;
        inner
            .transactions
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(transaction_id.to_string()))
    }

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> StoreResult<TransactionRecord> {
        let inner = self.inner.read().await;
        let transaction_id = inner
            .transaction_ids_by_reference
            .get(reference)
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(reference.to_string()))?;
        inner
            .transactions
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(reference.to_string()))
    }

    async fn update_transaction_status(
        &self,
        reference: &str,
        status: TransactionStatus,
        notes: Option<String>,
        now_unix_ms: u64,
    ) -> StoreResult<TransactionUpdate> {
        let mut inner = self.inner.write().await;
        let transaction_id = inner
            .transaction_ids_by_reference
            .get(reference)
            .cloned()
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(reference.to_string()))?;
        let record = inner
            .transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(reference.to_string()))?;

        if record.status == status {
            return Ok(TransactionUpdate {
                record: record.clone(),
                changed: false,
            });
        }

        record.status.ensure_transition(status)?;
        record.status = status;
        if notes.is_some() {
            record.notes = notes;
        }
        record.updated_unix_ms = now_unix_ms;
        Ok(TransactionUpdate {
            record: record.clone(),
            changed: true,
        })
    }

    async fn list_providers(&self, kind: ProviderKind) -> StoreResult<Vec<ProviderDescriptor>> {
        let inner = self.inner.read().await;
        let mut providers: Vec<ProviderDescriptor> = inner
            .providers
            .values()
            .filter(|descriptor| descriptor.kind == kind)
            .cloned()
            .collect();
        providers.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        Ok(providers)
    }

    async fn upsert_provider(&self, descriptor: ProviderDescriptor) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .providers
            .insert(descriptor.provider_id.clone(), descriptor);
        Ok(())
    }

    async fn set_provider_enabled(&self, provider_id: &str, enabled: bool) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let descriptor = inner
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| LedgerStoreError::ProviderNotFound(provider_id.to_string()))?;
        descriptor.enabled = enabled;
        Ok(())
    }

    async fn get_template(&self, message_kind: &str) -> StoreResult<MessageTemplate> {
        let inner = self.inner.read().await;
        inner
            .templates
            .get(message_kind)
            .cloned()
            .ok_or_else(|| LedgerStoreError::TemplateNotFound(message_kind.to_string()))
    }

    async fn upsert_template(&self, template: MessageTemplate) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .templates
            .insert(template.message_kind.clone(), template);
        Ok(())
    }

    async fn get_fee_rule(&self, kind: OperationKind, currency: &str) -> StoreResult<FeeRule> {
        let inner = self.inner.read().await;
        inner
            .fee_rules
            .get(&(kind, currency.to_string()))
            .copied()
            .ok_or_else(|| LedgerStoreError::FeeRuleNotFound {
                operation: kind.as_str(),
                currency: currency.to_string(),
            })
    }

    async fn upsert_fee_rule(
        &self,
        kind: OperationKind,
        currency: &str,
        rule: FeeRule,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.fee_rules.insert((kind, currency.to_string()), rule);
        Ok(())
    }

    async fn insert_attempt(&self, record: AttemptRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.attempts.push(record);
        Ok(())
    }

    async fn list_attempts(&self, dispatch_id: &str) -> StoreResult<Vec<AttemptRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .attempts
            .iter()
            .filter(|record| record.dispatch_id == dispatch_id)
            .cloned()
            .collect())
    }

    async fn register_dispatch(&self, reference: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.dispatch_refs.insert(reference.to_string()) {
            return Err(LedgerStoreError::DuplicateReference(reference.to_string()));
        }
        Ok(())
    }
}
