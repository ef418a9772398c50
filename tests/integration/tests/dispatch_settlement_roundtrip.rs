//! End-to-end scenarios wiring the notification and withdrawal services
//! over one shared in-memory store, with scripted providers and gateway.

use async_trait::async_trait;
use sente_dispatch::{
    DispatchEnvelope, DispatchProvider, NotificationDispatchConfig, NotificationService,
    NotifyError, ProviderCallError, ProviderFactory, ProviderReceipt,
};
use sente_gateway::{
    GatewayAcceptance, GatewayError, InitiationRequest, PaymentGateway, SettlementApplied,
    SettlementOutcome, StatusTracker, WithdrawError, WithdrawalConfig, WithdrawalService,
};
use sente_ledger::AdmissionError;
use sente_store::{InMemoryLedgerStore, LedgerStore};
use sente_types::{
    AttemptOutcome, BudgetState, FeeRule, MessageTemplate, NotificationRequest, OperationKind,
    ProviderDescriptor, ProviderKind, TransactionStatus, WalletState, WithdrawalRequest,
};
use std::collections::HashMap;
use std::sync::Arc;

struct ScriptedProvider {
    descriptor: ProviderDescriptor,
    fail: bool,
}

#[async_trait]
impl DispatchProvider for ScriptedProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(
        &self,
        _envelope: &DispatchEnvelope,
    ) -> Result<ProviderReceipt, ProviderCallError> {
        if self.fail {
            return Err(ProviderCallError::HttpStatus {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(ProviderReceipt {
            provider_message_id: format!("msg-{}", self.descriptor.provider_id),
        })
    }
}

struct ScriptedFactory {
    failing_ids: Vec<String>,
}

impl ProviderFactory for ScriptedFactory {
    fn build(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn DispatchProvider>, ProviderCallError> {
        Ok(Arc::new(ScriptedProvider {
            descriptor: descriptor.clone(),
            fail: self.failing_ids.contains(&descriptor.provider_id),
        }))
    }
}

struct AcceptingGateway;

#[async_trait]
impl PaymentGateway for AcceptingGateway {
    fn gateway_id(&self) -> &str {
        "mobile-money"
    }

    async fn initiate(
        &self,
        request: &InitiationRequest,
    ) -> Result<GatewayAcceptance, GatewayError> {
        Ok(GatewayAcceptance {
            gateway_reference: format!("mm-{}", request.reference),
        })
    }
}

fn email_provider(id: &str, priority: u32, cost: u64) -> ProviderDescriptor {
    ProviderDescriptor {
        provider_id: id.to_string(),
        kind: ProviderKind::Email,
        priority,
        unit_cost_minor: cost,
        enabled: true,
        endpoint: format!("https://{id}.example/send"),
        api_token: None,
        params: serde_json::Value::Null,
    }
}

async fn seeded_store() -> Arc<InMemoryLedgerStore> {
    let store = Arc::new(InMemoryLedgerStore::new());
    store
        .upsert_budget(BudgetState::with_limits("transactional-email", 100, 0, 0))
        .await
        .expect("seed budget");
    store
        .upsert_wallet(WalletState {
            account_id: "acct-1".to_string(),
            available_balance_minor: 10_000,
        })
        .await
        .expect("seed wallet");
    store
        .upsert_fee_rule(
            OperationKind::Withdrawal,
            "UGX",
            FeeRule {
                percent_bps: 200,
                flat_minor: 0,
                min_minor: Some(500),
                max_minor: Some(2_000),
            },
        )
        .await
        .expect("seed fee rule");
    store
        .upsert_template(MessageTemplate {
            message_kind: "withdrawal_completed".to_string(),
            subject: "Withdrawal of {amount} {currency} completed".to_string(),
            body: "Hello {name}, your withdrawal is done.".to_string(),
        })
        .await
        .expect("seed template");
    for (id, priority, cost) in [("mailer-a", 1u32, 40u64), ("mailer-b", 2, 35), ("mailer-c", 3, 30)]
    {
        store
            .upsert_provider(email_provider(id, priority, cost))
            .await
            .expect("seed provider");
    }
    store
}

fn notification_service(
    store: Arc<InMemoryLedgerStore>,
    failing_ids: &[&str],
) -> NotificationService {
    NotificationService::new(
        store as Arc<dyn LedgerStore>,
        NotificationDispatchConfig::default(),
    )
    .expect("notification service")
    .with_provider_factory(Arc::new(ScriptedFactory {
        failing_ids: failing_ids.iter().map(|id| id.to_string()).collect(),
    }))
}

fn notification(reference: Option<&str>) -> NotificationRequest {
    NotificationRequest {
        message_kind: "withdrawal_completed".to_string(),
        recipient: "shareholder@example.com".to_string(),
        placeholders: HashMap::from([
            ("amount".to_string(), "9000".to_string()),
            ("currency".to_string(), "UGX".to_string()),
            ("name".to_string(), "Akello".to_string()),
        ]),
        scope: "transactional-email".to_string(),
        reference: reference.map(str::to_string),
    }
}

fn withdrawal(reference: &str, amount: u64) -> WithdrawalRequest {
    WithdrawalRequest {
        account_id: "acct-1".to_string(),
        msisdn: "+256700000001".to_string(),
        amount_minor: amount,
        currency: "UGX".to_string(),
        reference: reference.to_string(),
    }
}

#[tokio::test]
async fn budget_saturation_rejects_the_third_dispatch() {
    let store = seeded_store().await;
    let service = notification_service(store.clone(), &[]);

    for round in 0..2 {
        let receipt = service
            .dispatch(notification(None))
            .await
            .unwrap_or_else(|error| panic!("dispatch {round} should be admitted: {error}"));
        assert_eq!(receipt.provider_id, "mailer-a");
        assert_eq!(receipt.cost_minor, 40);
        service.audit().flush().await;
    }
    assert_eq!(
        store
            .get_budget("transactional-email")
            .await
            .expect("budget")
            .spent_to_date,
        80
    );

    let error = service
        .dispatch(notification(None))
        .await
        .expect_err("third dispatch would reach 120");
    assert!(matches!(
        error,
        NotifyError::Admission(AdmissionError::BudgetExceeded { .. })
    ));
    service.audit().flush().await;
    let after = store
        .get_budget("transactional-email")
        .await
        .expect("budget");
    assert_eq!(after.spent_to_date, 80);
    assert_eq!(after.count_this_month, 2);
}

#[tokio::test]
async fn exhausted_provider_list_leaves_only_failed_attempts() {
    let store = seeded_store().await;
    // Only two providers configured for this scenario.
    store
        .set_provider_enabled("mailer-c", false)
        .await
        .expect("disable third");
    let service = notification_service(store.clone(), &["mailer-a", "mailer-b"]);

    let error = service
        .dispatch(notification(Some("ntf-all-fail")))
        .await
        .expect_err("both providers fail");
    let NotifyError::AllProvidersFailed { attempts_tried, .. } = error else {
        panic!("expected AllProvidersFailed");
    };
    assert_eq!(attempts_tried, 2);

    service.audit().flush().await;
    let attempts = store.list_attempts("ntf-all-fail").await.expect("attempts");
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .all(|record| record.outcome == AttemptOutcome::Failed));
    assert_eq!(
        store
            .get_budget("transactional-email")
            .await
            .expect("budget")
            .spent_to_date,
        0
    );
}

#[tokio::test]
async fn withdrawal_settles_idempotently_after_initiation() {
    let store = seeded_store().await;
    let withdrawals = WithdrawalService::new(
        store.clone() as Arc<dyn LedgerStore>,
        Arc::new(AcceptingGateway),
        WithdrawalConfig::default(),
    )
    .expect("withdrawal service");
    let tracker = StatusTracker::new(store.clone() as Arc<dyn LedgerStore>, 64);

    // Balance 10_000, amount 9_000, fee clamps up to 500.
    let receipt = withdrawals
        .dispatch(withdrawal("wd-1", 9_000))
        .await
        .expect("admitted and initiated");
    assert_eq!(receipt.status, TransactionStatus::Processing);
    assert_eq!(receipt.fee_minor, 500);
    assert_eq!(
        store
            .get_wallet("acct-1")
            .await
            .expect("wallet")
            .available_balance_minor,
        500
    );

    let first = tracker
        .apply_settlement("wd-1", SettlementOutcome::Completed)
        .await
        .expect("settlement callback");
    assert!(matches!(first, SettlementApplied::Applied(_)));
    let replay = tracker
        .apply_settlement("wd-1", SettlementOutcome::Completed)
        .await
        .expect("duplicate callback");
    assert!(matches!(replay, SettlementApplied::AlreadyApplied(_)));
    assert_eq!(replay.record(), first.record());

    tracker.audit().flush().await;
    withdrawals.audit().flush().await;
    // Completed settlement keeps the debit; balance unchanged by replay.
    assert_eq!(
        store
            .get_wallet("acct-1")
            .await
            .expect("wallet")
            .available_balance_minor,
        500
    );
    let status = tracker
        .get_status(&receipt.transaction_id)
        .await
        .expect("status query");
    assert_eq!(status.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn failed_settlement_refunds_and_second_withdrawal_fits_again() {
    let store = seeded_store().await;
    let withdrawals = WithdrawalService::new(
        store.clone() as Arc<dyn LedgerStore>,
        Arc::new(AcceptingGateway),
        WithdrawalConfig::default(),
    )
    .expect("withdrawal service");
    let tracker = StatusTracker::new(store.clone() as Arc<dyn LedgerStore>, 64);

    withdrawals
        .dispatch(withdrawal("wd-1", 9_000))
        .await
        .expect("first withdrawal");

    // With 500 left, a second withdrawal of 9_000 cannot be admitted.
    let error = withdrawals
        .dispatch(withdrawal("wd-2", 9_000))
        .await
        .expect_err("balance exhausted");
    assert!(matches!(error, WithdrawError::InsufficientFunds { .. }));

    tracker
        .apply_settlement(
            "wd-1",
            SettlementOutcome::Failed {
                reason: "recipient wallet closed".to_string(),
            },
        )
        .await
        .expect("failure settlement");
    tracker.audit().flush().await;

    // The refund restored the full reserve, so the retry fits now.
    assert_eq!(
        store
            .get_wallet("acct-1")
            .await
            .expect("wallet")
            .available_balance_minor,
        10_000
    );
    let retry = withdrawals
        .dispatch(withdrawal("wd-3", 9_000))
        .await
        .expect("retry after refund");
    assert_eq!(retry.status, TransactionStatus::Processing);
}
