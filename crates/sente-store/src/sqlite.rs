//! SQLite-backed `LedgerStore` implementation with durable persistence.

use crate::{LedgerStore, LedgerStoreError, StoreResult, TransactionUpdate};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sente_types::{
    AttemptOutcome, AttemptRecord, BudgetState, FeeRule, MessageTemplate, OperationKind,
    ProviderDescriptor, ProviderKind, TransactionRecord, TransactionStatus, WalletState,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent SQLite store backend for the dispatch engine.
#[derive(Debug)]
pub struct SqliteLedgerStore {
    db_path: PathBuf,
}

impl SqliteLedgerStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS budgets (
                scope TEXT PRIMARY KEY,
                spent_to_date INTEGER NOT NULL,
                count_today INTEGER NOT NULL,
                count_this_month INTEGER NOT NULL,
                limit_total INTEGER NOT NULL,
                limit_per_day INTEGER NOT NULL,
                limit_per_month INTEGER NOT NULL,
                day_key TEXT NOT NULL,
                month_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wallets (
                account_id TEXT PRIMARY KEY,
                available_balance INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS providers (
                provider_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                priority INTEGER NOT NULL,
                unit_cost INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                endpoint TEXT NOT NULL,
                api_token TEXT NULL,
                params_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_providers_kind ON providers (kind, priority);

            CREATE TABLE IF NOT EXISTS templates (
                message_kind TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fee_rules (
                operation TEXT NOT NULL,
                currency TEXT NOT NULL,
                percent_bps INTEGER NOT NULL,
                flat INTEGER NOT NULL,
                min INTEGER NULL,
                max INTEGER NULL,
                PRIMARY KEY (operation, currency)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                transaction_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                msisdn TEXT NOT NULL,
                amount INTEGER NOT NULL,
                fee INTEGER NOT NULL,
                currency TEXT NOT NULL,
                reference TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                notes TEXT NULL,
                refunded INTEGER NOT NULL,
                created_unix_ms INTEGER NOT NULL,
                updated_unix_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attempts (
                attempt_id TEXT PRIMARY KEY,
                dispatch_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                cost INTEGER NOT NULL,
                provider_message_id TEXT NULL,
                error_detail TEXT NULL,
                created_unix_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_dispatch
                ON attempts (dispatch_id, created_unix_ms);

            CREATE TABLE IF NOT EXISTS dispatch_refs (
                reference TEXT PRIMARY KEY
            );
            "#,
        )?;
        Ok(())
    }
}

fn money_to_db(field: &'static str, value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| LedgerStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn money_from_db(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| LedgerStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn provider_kind_to_db(kind: ProviderKind) -> &'static str {
    kind.as_str()
}

fn provider_kind_from_db(value: &str) -> StoreResult<ProviderKind> {
    match value {
        "email" => Ok(ProviderKind::Email),
        "payout" => Ok(ProviderKind::Payout),
        other => Err(LedgerStoreError::InvalidPersistedValue {
            field: "provider.kind",
            value: other.to_string(),
        }),
    }
}

fn operation_kind_to_db(kind: OperationKind) -> &'static str {
    kind.as_str()
}

fn outcome_to_db(outcome: AttemptOutcome) -> &'static str {
    outcome.as_str()
}

fn outcome_from_db(value: &str) -> StoreResult<AttemptOutcome> {
    match value {
        "sent" => Ok(AttemptOutcome::Sent),
        "failed" => Ok(AttemptOutcome::Failed),
        other => Err(LedgerStoreError::InvalidPersistedValue {
            field: "attempt.outcome",
            value: other.to_string(),
        }),
    }
}

fn status_to_db(status: TransactionStatus) -> &'static str {
    status.as_str()
}

fn status_from_db(value: &str) -> StoreResult<TransactionStatus> {
    match value {
        "pending" => Ok(TransactionStatus::Pending),
        "processing" => Ok(TransactionStatus::Processing),
        "completed" => Ok(TransactionStatus::Completed),
        "failed" => Ok(TransactionStatus::Failed),
        other => Err(LedgerStoreError::InvalidPersistedValue {
            field: "transaction.status",
            value: other.to_string(),
        }),
    }
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

type TransactionRow = (
    String,
    String,
    String,
    i64,
    i64,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    i64,
);

const TRANSACTION_COLUMNS: &str = "transaction_id, account_id, msisdn, amount, fee, currency, \
     reference, status, notes, refunded, created_unix_ms, updated_unix_ms";

fn map_transaction_row(row: TransactionRow) -> StoreResult<TransactionRecord> {
    let (
        transaction_id,
        account_id,
        msisdn,
        amount,
        fee,
        currency,
        reference,
        status,
        notes,
        refunded,
        created_unix_ms,
        updated_unix_ms,
    ) = row;
    Ok(TransactionRecord {
        transaction_id,
        account_id,
        msisdn,
        amount_minor: money_from_db("transaction.amount", amount)?,
        fee_minor: money_from_db("transaction.fee", fee)?,
        currency,
        reference,
        status: status_from_db(&status)?,
        notes,
        refunded: refunded != 0,
        created_unix_ms: money_from_db("transaction.created_unix_ms", created_unix_ms)?,
        updated_unix_ms: money_from_db("transaction.updated_unix_ms", updated_unix_ms)?,
    })
}

fn query_transaction(
    connection: &Connection,
    where_clause: &str,
    key: &str,
) -> StoreResult<Option<TransactionRecord>> {
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE {where_clause} = ?1");
    connection
        .query_row(&sql, params![key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, i64>(11)?,
            ))
        })
        .optional()?
        .map(map_transaction_row)
        .transpose()
}

fn query_budget(connection: &Connection, scope: &str) -> StoreResult<Option<BudgetState>> {
    connection
        .query_row(
            r#"
            SELECT scope, spent_to_date, count_today, count_this_month,
                   limit_total, limit_per_day, limit_per_month, day_key, month_key
            FROM budgets
            WHERE scope = ?1
            "#,
            params![scope],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?
        .map(
            |(
                scope,
                spent_to_date,
                count_today,
                count_this_month,
                limit_total,
                limit_per_day,
                limit_per_month,
                day_key,
                month_key,
            )|
             -> StoreResult<BudgetState> {
                Ok(BudgetState {
                    scope,
                    spent_to_date: money_from_db("budget.spent_to_date", spent_to_date)?,
                    count_today: money_from_db("budget.count_today", count_today)?,
                    count_this_month: money_from_db("budget.count_this_month", count_this_month)?,
                    limit_total: money_from_db("budget.limit_total", limit_total)?,
                    limit_per_day: money_from_db("budget.limit_per_day", limit_per_day)?,
                    limit_per_month: money_from_db("budget.limit_per_month", limit_per_month)?,
                    day_key,
                    month_key,
                })
            },
        )
        .transpose()
}

fn write_budget(connection: &Connection, state: &BudgetState) -> StoreResult<()> {
    connection.execute(
        r#"
        INSERT INTO budgets (
            scope, spent_to_date, count_today, count_this_month,
            limit_total, limit_per_day, limit_per_month, day_key, month_key
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(scope) DO UPDATE SET
            spent_to_date = excluded.spent_to_date,
            count_today = excluded.count_today,
            count_this_month = excluded.count_this_month,
            limit_total = excluded.limit_total,
            limit_per_day = excluded.limit_per_day,
            limit_per_month = excluded.limit_per_month,
            day_key = excluded.day_key,
            month_key = excluded.month_key
        "#,
        params![
            state.scope,
            money_to_db("budget.spent_to_date", state.spent_to_date)?,
            money_to_db("budget.count_today", state.count_today)?,
            money_to_db("budget.count_this_month", state.count_this_month)?,
            money_to_db("budget.limit_total", state.limit_total)?,
            money_to_db("budget.limit_per_day", state.limit_per_day)?,
            money_to_db("budget.limit_per_month", state.limit_per_month)?,
            state.day_key,
            state.month_key,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get_budget(&self, scope: &str) -> StoreResult<BudgetState> {
        let connection = self.open_connection()?;
        query_budget(&connection, scope)?
            .ok_or_else(|| LedgerStoreError::ScopeNotFound(scope.to_string()))
    }

    async fn upsert_budget(&self, state: BudgetState) -> StoreResult<()> {
        let connection = self.open_connection()?;
        write_budget(&connection, &state)
    }

    async fn apply_budget_charge(
        &self,
        scope: &str,
        cost_minor: u64,
        now_unix_ms: u64,
    ) -> StoreResult<BudgetState> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut state = query_budget(&transaction, scope)?
            .ok_or_else(|| LedgerStoreError::ScopeNotFound(scope.to_string()))?;
        crate::roll_budget_period(&mut state, now_unix_ms);
        state.spent_to_date = state.spent_to_date.saturating_add(cost_minor);
        state.count_today = state.count_today.saturating_add(1);
        state.count_this_month = state.count_this_month.saturating_add(1);
        write_budget(&transaction, &state)?;

        transaction.commit()?;
        Ok(state)
    }

    async fn get_wallet(&self, account_id: &str) -> StoreResult<WalletState> {
        let connection = self.open_connection()?;
        let balance: Option<i64> = connection
            .query_row(
                "SELECT available_balance FROM wallets WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        let balance =
            balance.ok_or_else(|| LedgerStoreError::WalletNotFound(account_id.to_string()))?;
        Ok(WalletState {
            account_id: account_id.to_string(),
            available_balance_minor: money_from_db("wallet.available_balance", balance)?,
        })
    }

    async fn upsert_wallet(&self, wallet: WalletState) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO wallets (account_id, available_balance) VALUES (?1, ?2)
            ON CONFLICT(account_id) DO UPDATE SET
                available_balance = excluded.available_balance
            "#,
            params![
                wallet.account_id,
                money_to_db("wallet.available_balance", wallet.available_balance_minor)?,
            ],
        )?;
        Ok(())
    }

    async fn reserve_withdrawal(&self, record: &TransactionRecord) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let duplicate = transaction
            .query_row(
                "SELECT 1 FROM transactions WHERE reference = ?1",
                params![record.reference],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Err(LedgerStoreError::DuplicateReference(
                record.reference.clone(),
            ));
        }

        let balance: Option<i64> = transaction
            .query_row(
                "SELECT available_balance FROM wallets WHERE account_id = ?1",
                params![record.account_id],
                |row| row.get(0),
            )
            .optional()?;
        let balance =
            balance.ok_or_else(|| LedgerStoreError::WalletNotFound(record.account_id.clone()))?;
        let available_minor = money_from_db("wallet.available_balance", balance)?;
        let required_minor = record.reserved_minor();
        if required_minor > available_minor {
            return Err(LedgerStoreError::InsufficientFunds {
                available_minor,
                required_minor,
            });
        }

        transaction.execute(
            "UPDATE wallets SET available_balance = available_balance - ?1 WHERE account_id = ?2",
            params![
                money_to_db("wallet.debit", required_minor)?,
                record.account_id,
            ],
        )?;
        transaction.execute(
            &format!(
                "INSERT INTO transactions ({TRANSACTION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                record.transaction_id,
                record.account_id,
                record.msisdn,
                money_to_db("transaction.amount", record.amount_minor)?,
                money_to_db("transaction.fee", record.fee_minor)?,
                record.currency,
                record.reference,
                status_to_db(record.status),
                record.notes,
                i64::from(record.refunded),
                money_to_db("transaction.created_unix_ms", record.created_unix_ms)?,
                money_to_db("transaction.updated_unix_ms", record.updated_unix_ms)?,
            ],
        )?;

        transaction.commit()?;
        Ok(())
    }

    async fn refund_withdrawal(&self, transaction_id: &str) -> StoreResult<bool> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(String, i64, i64, i64)> = transaction
            .query_row(
                "SELECT account_id, amount, fee, refunded FROM transactions \
                 WHERE transaction_id = ?1",
                params![transaction_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((account_id, amount, fee, refunded)) = row else {
            return Err(LedgerStoreError::TransactionNotFound(
                transaction_id.to_string(),
            ));
        };
        if refunded != 0 {
            transaction.commit()?;
            return Ok(false);
        }

        let reserved_minor = money_from_db("transaction.amount", amount)?
            .saturating_add(money_from_db("transaction.fee", fee)?);
        transaction.execute(
            "UPDATE transactions SET refunded = 1 WHERE transaction_id = ?1",
            params![transaction_id],
        )?;
        let credited = transaction.execute(
            "UPDATE wallets SET available_balance = available_balance + ?1 WHERE account_id = ?2",
            params![money_to_db("wallet.credit", reserved_minor)?, account_id],
        )?;
        if credited != 1 {
            return Err(LedgerStoreError::WalletNotFound(account_id));
        }

        transaction.commit()?;
        Ok(true)
    }

    async fn get_transaction(&self, transaction_id: &str) -> StoreResult<TransactionRecord> {
        let connection = self.open_connection()?;
        query_transaction(&connection, "transaction_id", transaction_id)?
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(transaction_id.to_string()))
    }

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> StoreResult<TransactionRecord> {
        let connection = self.open_connection()?;
        query_transaction(&connection, "reference", reference)?
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(reference.to_string()))
    }

    async fn update_transaction_status(
        &self,
        reference: &str,
        status: TransactionStatus,
        notes: Option<String>,
        now_unix_ms: u64,
    ) -> StoreResult<TransactionUpdate> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = query_transaction(&transaction, "reference", reference)?
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(reference.to_string()))?;
        if record.status == status {
            transaction.commit()?;
            return Ok(TransactionUpdate {
                record,
                changed: false,
            });
        }

        record.status.ensure_transition(status)?;
        record.status = status;
        if notes.is_some() {
            record.notes = notes;
        }
        record.updated_unix_ms = now_unix_ms;

        transaction.execute(
            "UPDATE transactions SET status = ?1, notes = ?2, updated_unix_ms = ?3 \
             WHERE reference = ?4",
            params![
                status_to_db(record.status),
                record.notes,
                money_to_db("transaction.updated_unix_ms", record.updated_unix_ms)?,
                reference,
            ],
        )?;

        transaction.commit()?;
        Ok(TransactionUpdate {
            record,
            changed: true,
        })
    }

    async fn list_providers(&self, kind: ProviderKind) -> StoreResult<Vec<ProviderDescriptor>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT provider_id, kind, priority, unit_cost, enabled, endpoint,
                   api_token, params_json
            FROM providers
            WHERE kind = ?1
            ORDER BY priority ASC, provider_id ASC
            "#,
        )?;
        let rows = statement.query_map(params![provider_kind_to_db(kind)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut providers = Vec::new();
        for row in rows {
            let (provider_id, kind, priority, unit_cost, enabled, endpoint, api_token, params_json) =
                row?;
            providers.push(ProviderDescriptor {
                provider_id,
                kind: provider_kind_from_db(&kind)?,
                priority: u32::try_from(priority).map_err(|_| {
                    LedgerStoreError::InvalidPersistedValue {
                        field: "provider.priority",
                        value: priority.to_string(),
                    }
                })?,
                unit_cost_minor: money_from_db("provider.unit_cost", unit_cost)?,
                enabled: enabled != 0,
                endpoint,
                api_token,
                params: serde_json::from_str(&params_json)?,
            });
        }
        Ok(providers)
    }

    async fn upsert_provider(&self, descriptor: ProviderDescriptor) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO providers (
                provider_id, kind, priority, unit_cost, enabled, endpoint,
                api_token, params_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(provider_id) DO UPDATE SET
                kind = excluded.kind,
                priority = excluded.priority,
                unit_cost = excluded.unit_cost,
                enabled = excluded.enabled,
                endpoint = excluded.endpoint,
                api_token = excluded.api_token,
                params_json = excluded.params_json
            "#,
            params![
                descriptor.provider_id,
                provider_kind_to_db(descriptor.kind),
                i64::from(descriptor.priority),
                money_to_db("provider.unit_cost", descriptor.unit_cost_minor)?,
                i64::from(descriptor.enabled),
                descriptor.endpoint,
                descriptor.api_token,
                serde_json::to_string(&descriptor.params)?,
            ],
        )?;
        Ok(())
    }

    async fn set_provider_enabled(&self, provider_id: &str, enabled: bool) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let updated = connection.execute(
            "UPDATE providers SET enabled = ?1 WHERE provider_id = ?2",
            params![i64::from(enabled), provider_id],
        )?;
        if updated != 1 {
            return Err(LedgerStoreError::ProviderNotFound(provider_id.to_string()));
        }
        Ok(())
    }

    async fn get_template(&self, message_kind: &str) -> StoreResult<MessageTemplate> {
        let connection = self.open_connection()?;
        connection
            .query_row(
                "SELECT message_kind, subject, body FROM templates WHERE message_kind = ?1",
                params![message_kind],
                |row| {
                    Ok(MessageTemplate {
                        message_kind: row.get(0)?,
                        subject: row.get(1)?,
                        body: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| LedgerStoreError::TemplateNotFound(message_kind.to_string()))
    }

    async fn upsert_template(&self, template: MessageTemplate) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO templates (message_kind, subject, body) VALUES (?1, ?2, ?3)
            ON CONFLICT(message_kind) DO UPDATE SET
                subject = excluded.subject,
                body = excluded.body
            "#,
            params![template.message_kind, template.subject, template.body],
        )?;
        Ok(())
    }

    async fn get_fee_rule(&self, kind: OperationKind, currency: &str) -> StoreResult<FeeRule> {
        let connection = self.open_connection()?;
        let row: Option<(i64, i64, Option<i64>, Option<i64>)> = connection
            .query_row(
                "SELECT percent_bps, flat, min, max FROM fee_rules \
                 WHERE operation = ?1 AND currency = ?2",
                params![operation_kind_to_db(kind), currency],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((percent_bps, flat, min, max)) = row else {
            return Err(LedgerStoreError::FeeRuleNotFound {
                operation: kind.as_str(),
                currency: currency.to_string(),
            });
        };
        Ok(FeeRule {
            percent_bps: u32::try_from(percent_bps).map_err(|_| {
                LedgerStoreError::InvalidPersistedValue {
                    field: "fee_rule.percent_bps",
                    value: percent_bps.to_string(),
                }
            })?,
            flat_minor: money_from_db("fee_rule.flat", flat)?,
            min_minor: min.map(|value| money_from_db("fee_rule.min", value)).transpose()?,
            max_minor: max.map(|value| money_from_db("fee_rule.max", value)).transpose()?,
        })
    }

    async fn upsert_fee_rule(
        &self,
        kind: OperationKind,
        currency: &str,
        rule: FeeRule,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO fee_rules (operation, currency, percent_bps, flat, min, max)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(operation, currency) DO UPDATE SET
                percent_bps = excluded.percent_bps,
                flat = excluded.flat,
                min = excluded.min,
                max = excluded.max
            "#,
            params![
                operation_kind_to_db(kind),
                currency,
                i64::from(rule.percent_bps),
                money_to_db("fee_rule.flat", rule.flat_minor)?,
                rule.min_minor
                    .map(|value| money_to_db("fee_rule.min", value))
                    .transpose()?,
                rule.max_minor
                    .map(|value| money_to_db("fee_rule.max", value))
                    .transpose()?,
            ],
        )?;
        Ok(())
    }

    async fn insert_attempt(&self, record: AttemptRecord) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO attempts (
                attempt_id, dispatch_id, provider_id, outcome, cost,
                provider_message_id, error_detail, created_unix_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.attempt_id,
                record.dispatch_id,
                record.provider_id,
                outcome_to_db(record.outcome),
                money_to_db("attempt.cost", record.cost_minor)?,
                record.provider_message_id,
                record.error_detail,
                money_to_db("attempt.created_unix_ms", record.created_unix_ms)?,
            ],
        )?;
        Ok(())
    }

    async fn list_attempts(&self, dispatch_id: &str) -> StoreResult<Vec<AttemptRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT attempt_id, dispatch_id, provider_id, outcome, cost,
                   provider_message_id, error_detail, created_unix_ms
            FROM attempts
            WHERE dispatch_id = ?1
            ORDER BY created_unix_ms ASC, attempt_id ASC
            "#,
        )?;
        let rows = statement.query_map(params![dispatch_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut attempts = Vec::new();
        for row in rows {
            let (
                attempt_id,
                dispatch_id,
                provider_id,
                outcome,
                cost,
                provider_message_id,
                error_detail,
                created_unix_ms,
            ) = row?;
            attempts.push(AttemptRecord {
                attempt_id,
                dispatch_id,
                provider_id,
                outcome: outcome_from_db(&outcome)?,
                cost_minor: money_from_db("attempt.cost", cost)?,
                provider_message_id,
                error_detail,
                created_unix_ms: money_from_db("attempt.created_unix_ms", created_unix_ms)?,
            });
        }
        Ok(attempts)
    }

    async fn register_dispatch(&self, reference: &str) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let result = connection.execute(
            "INSERT INTO dispatch_refs (reference) VALUES (?1)",
            params![reference],
        );
        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(
                LedgerStoreError::DuplicateReference(reference.to_string()),
            ),
            Err(error) => Err(error.into()),
        }
    }
}
