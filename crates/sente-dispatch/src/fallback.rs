//! Fallback-executing dispatch loop.
//!
//! Providers are tried strictly sequentially in priority order so at most
//! one backend is charged and at most one external side effect occurs per
//! request. Each attempt is bounded by a fixed timeout and produces exactly
//! one audit record; the first success wins and ends the loop.

use crate::audit::AuditSink;
use crate::provider::{DispatchEnvelope, DispatchProvider, ProviderCallError, ProviderReceipt};
use crate::{ClockFn, DispatchEventSink};
use sente_core::{current_unix_timestamp_ms, new_correlation_id};
use sente_types::{AttemptOutcome, AttemptRecord};
use std::sync::Arc;
use std::time::Duration;

/// Successful dispatch: which provider delivered, what it cost, and how many
/// providers were tried to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSuccess {
    pub provider_id: String,
    pub unit_cost_minor: u64,
    pub provider_message_id: String,
    pub attempts_tried: usize,
}

/// Terminal failure: the provider list was exhausted without a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchExhausted {
    pub attempts_tried: usize,
    pub last_error: String,
}

/// The fallback executor. Holds no per-request state; one value serves every
/// dispatch of a service instance.
pub struct FallbackDispatcher {
    attempt_timeout_ms: u64,
    event_sink: Option<DispatchEventSink>,
    clock: ClockFn,
}

impl FallbackDispatcher {
    pub fn new(attempt_timeout_ms: u64) -> Self {
        Self::new_with_clock(
            attempt_timeout_ms,
            None,
            Arc::new(current_unix_timestamp_ms),
        )
    }

    pub fn with_event_sink(attempt_timeout_ms: u64, event_sink: DispatchEventSink) -> Self {
        Self::new_with_clock(
            attempt_timeout_ms,
            Some(event_sink),
            Arc::new(current_unix_timestamp_ms),
        )
    }

    pub(crate) fn new_with_clock(
        attempt_timeout_ms: u64,
        event_sink: Option<DispatchEventSink>,
        clock: ClockFn,
    ) -> Self {
        Self {
            attempt_timeout_ms,
            event_sink,
            clock,
        }
    }

    /// Runs the fallback loop over `providers` (already priority-ordered and
    /// enabled-filtered). Every attempt, failed or sent, lands in the audit
    /// sink without blocking the loop.
    pub async fn dispatch(
        &self,
        envelope: &DispatchEnvelope,
        providers: &[Arc<dyn DispatchProvider>],
        audit: &AuditSink,
    ) -> Result<DispatchSuccess, DispatchExhausted> {
        let mut last_error = "no providers attempted".to_string();

        for (index, provider) in providers.iter().enumerate() {
            let descriptor = provider.descriptor();
            let attempt = tokio::time::timeout(
                Duration::from_millis(self.attempt_timeout_ms.max(1)),
                provider.send(envelope),
            )
            .await
            .unwrap_or(Err(ProviderCallError::Timeout {
                elapsed_ms: self.attempt_timeout_ms,
            }));

            match attempt {
                Ok(ProviderReceipt {
                    provider_message_id,
                }) => {
                    audit.record_attempt(AttemptRecord {
                        attempt_id: new_correlation_id("att"),
                        dispatch_id: envelope.dispatch_id.clone(),
                        provider_id: descriptor.provider_id.clone(),
                        outcome: AttemptOutcome::Sent,
                        cost_minor: descriptor.unit_cost_minor,
                        provider_message_id: Some(provider_message_id.clone()),
                        error_detail: None,
                        created_unix_ms: (self.clock)(),
                    });
                    return Ok(DispatchSuccess {
                        provider_id: descriptor.provider_id.clone(),
                        unit_cost_minor: descriptor.unit_cost_minor,
                        provider_message_id,
                        attempts_tried: index + 1,
                    });
                }
                Err(error) => {
                    audit.record_attempt(AttemptRecord {
                        attempt_id: new_correlation_id("att"),
                        dispatch_id: envelope.dispatch_id.clone(),
                        provider_id: descriptor.provider_id.clone(),
                        outcome: AttemptOutcome::Failed,
                        cost_minor: 0,
                        provider_message_id: None,
                        error_detail: Some(error.to_string()),
                        created_unix_ms: (self.clock)(),
                    });
                    if let Some(next) = providers.get(index + 1) {
                        self.emit_fallback_event(descriptor.provider_id.as_str(), next, &error, index + 1);
                    }
                    last_error = error.to_string();
                }
            }
        }

        Err(DispatchExhausted {
            attempts_tried: providers.len(),
            last_error,
        })
    }

    fn emit_fallback_event(
        &self,
        from_provider: &str,
        to: &Arc<dyn DispatchProvider>,
        error: &ProviderCallError,
        fallback_index: usize,
    ) {
        let Some(sink) = &self.event_sink else {
            return;
        };
        let (error_kind, status) = provider_error_metadata(error);
        sink(serde_json::json!({
            "type": "provider_fallback",
            "from_provider": from_provider,
            "to_provider": to.descriptor().provider_id.as_str(),
            "error_kind": error_kind,
            "status": status,
            "fallback_index": fallback_index,
        }));
    }
}

fn provider_error_metadata(error: &ProviderCallError) -> (&'static str, Option<u16>) {
    match error {
        ProviderCallError::HttpStatus { status, .. } => ("http_status", Some(*status)),
        ProviderCallError::Http(inner) if inner.is_timeout() => ("http_timeout", None),
        ProviderCallError::Http(inner) if inner.is_connect() => ("http_connect", None),
        ProviderCallError::Http(_) => ("http_other", None),
        ProviderCallError::InvalidResponse(_) => ("invalid_response", None),
        ProviderCallError::Timeout { .. } => ("attempt_timeout", None),
        ProviderCallError::Misconfigured(_) => ("misconfigured", None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use async_trait::async_trait;
    use sente_store::{InMemoryLedgerStore, LedgerStore};
    use sente_types::{ProviderDescriptor, ProviderKind};
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockProvider {
        descriptor: ProviderDescriptor,
        responses: Mutex<VecDeque<Result<ProviderReceipt, ProviderCallError>>>,
        observed: Mutex<Vec<String>>,
    }

    impl MockProvider {
        fn new(
            id: &str,
            cost: u64,
            responses: Vec<Result<ProviderReceipt, ProviderCallError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                descriptor: ProviderDescriptor {
                    provider_id: id.to_string(),
                    kind: ProviderKind::Email,
                    priority: 1,
                    unit_cost_minor: cost,
                    enabled: true,
                    endpoint: format!("https://{id}.example/send"),
                    api_token: None,
                    params: Value::Null,
                },
                responses: Mutex::new(responses.into()),
                observed: Mutex::new(Vec::new()),
            })
        }

        fn observed(&self) -> Vec<String> {
            self.observed.lock().expect("observed lock").clone()
        }
    }

    #[async_trait]
    impl DispatchProvider for MockProvider {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        async fn send(
            &self,
            envelope: &DispatchEnvelope,
        ) -> Result<ProviderReceipt, ProviderCallError> {
            self.observed
                .lock()
                .expect("observed lock")
                .push(envelope.dispatch_id.clone());
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or(Err(ProviderCallError::InvalidResponse(
                    "no mock response configured".to_string(),
                )))
        }
    }

    fn receipt(id: &str) -> Result<ProviderReceipt, ProviderCallError> {
        Ok(ProviderReceipt {
            provider_message_id: id.to_string(),
        })
    }

    fn failure(status: u16) -> Result<ProviderReceipt, ProviderCallError> {
        Err(ProviderCallError::HttpStatus {
            status,
            body: "provider unavailable".to_string(),
        })
    }

    fn envelope() -> DispatchEnvelope {
        DispatchEnvelope {
            dispatch_id: "ntf-1".to_string(),
            recipient: "shareholder@example.com".to_string(),
            subject: "subject".to_string(),
            body: "body".to_string(),
        }
    }

    async fn sink_over(store: Arc<dyn LedgerStore>) -> AuditSink {
        AuditSink::spawn(store, 64)
    }

    #[tokio::test]
    async fn functional_first_success_stops_the_loop() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let audit = sink_over(store.clone()).await;
        let primary = MockProvider::new("mailer-a", 40, vec![receipt("msg-1")]);
        let secondary = MockProvider::new("mailer-b", 35, vec![receipt("msg-2")]);
        let providers: Vec<Arc<dyn DispatchProvider>> =
            vec![primary.clone(), secondary.clone()];

        let success = FallbackDispatcher::new(1_000)
            .dispatch(&envelope(), &providers, &audit)
            .await
            .expect("primary should deliver");

        assert_eq!(success.provider_id, "mailer-a");
        assert_eq!(success.unit_cost_minor, 40);
        assert_eq!(success.provider_message_id, "msg-1");
        assert_eq!(success.attempts_tried, 1);
        assert!(secondary.observed().is_empty());

        audit.flush().await;
        let attempts = store.list_attempts("ntf-1").await.expect("attempts");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Sent);
        assert_eq!(attempts[0].cost_minor, 40);
    }

    #[tokio::test]
    async fn functional_fallback_writes_one_record_per_attempt() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let audit = sink_over(store.clone()).await;
        let first = MockProvider::new("mailer-a", 40, vec![failure(503)]);
        let second = MockProvider::new("mailer-b", 35, vec![failure(500)]);
        let third = MockProvider::new("mailer-c", 30, vec![receipt("msg-3")]);
        let providers: Vec<Arc<dyn DispatchProvider>> =
            vec![first.clone(), second.clone(), third.clone()];

        let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let events_sink = events.clone();
        let dispatcher = FallbackDispatcher::with_event_sink(
            1_000,
            Arc::new(move |event| events_sink.lock().expect("events lock").push(event)),
        );

        let success = dispatcher
            .dispatch(&envelope(), &providers, &audit)
            .await
            .expect("third provider should deliver");
        assert_eq!(success.provider_id, "mailer-c");
        assert_eq!(success.attempts_tried, 3);

        audit.flush().await;
        let attempts = store.list_attempts("ntf-1").await.expect("attempts");
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts
                .iter()
                .filter(|record| record.outcome == AttemptOutcome::Failed)
                .count(),
            2
        );
        assert_eq!(
            attempts
                .iter()
                .filter(|record| record.outcome == AttemptOutcome::Sent)
                .count(),
            1
        );

        let events = events.lock().expect("events lock");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "provider_fallback");
        assert_eq!(events[0]["from_provider"], "mailer-a");
        assert_eq!(events[0]["to_provider"], "mailer-b");
        assert_eq!(events[0]["status"], 503);
    }

    #[tokio::test]
    async fn functional_exhausted_list_reports_last_error() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let audit = sink_over(store.clone()).await;
        let first = MockProvider::new("mailer-a", 40, vec![failure(503)]);
        let second = MockProvider::new("mailer-b", 35, vec![failure(429)]);
        let providers: Vec<Arc<dyn DispatchProvider>> = vec![first, second];

        let exhausted = FallbackDispatcher::new(1_000)
            .dispatch(&envelope(), &providers, &audit)
            .await
            .expect_err("both providers fail");
        assert_eq!(exhausted.attempts_tried, 2);
        assert!(exhausted.last_error.contains("429"));

        audit.flush().await;
        let attempts = store.list_attempts("ntf-1").await.expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert!(attempts
            .iter()
            .all(|record| record.outcome == AttemptOutcome::Failed));
    }

    #[tokio::test]
    async fn regression_slow_provider_times_out_and_falls_back() {
        struct SlowProvider {
            descriptor: ProviderDescriptor,
        }

        #[async_trait]
        impl DispatchProvider for SlowProvider {
            fn descriptor(&self) -> &ProviderDescriptor {
                &self.descriptor
            }

            async fn send(
                &self,
                _envelope: &DispatchEnvelope,
            ) -> Result<ProviderReceipt, ProviderCallError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ProviderReceipt {
                    provider_message_id: "too-late".to_string(),
                })
            }
        }

        let store = Arc::new(InMemoryLedgerStore::new());
        let audit = sink_over(store.clone()).await;
        let slow: Arc<dyn DispatchProvider> = Arc::new(SlowProvider {
            descriptor: ProviderDescriptor {
                provider_id: "mailer-slow".to_string(),
                kind: ProviderKind::Email,
                priority: 1,
                unit_cost_minor: 40,
                enabled: true,
                endpoint: "https://slow.example/send".to_string(),
                api_token: None,
                params: Value::Null,
            },
        });
        let fast = MockProvider::new("mailer-fast", 35, vec![receipt("msg-fast")]);
        let providers: Vec<Arc<dyn DispatchProvider>> = vec![slow, fast.clone()];

        let success = FallbackDispatcher::new(50)
            .dispatch(&envelope(), &providers, &audit)
            .await
            .expect("fast provider should deliver after timeout");
        assert_eq!(success.provider_id, "mailer-fast");

        audit.flush().await;
        let attempts = store.list_attempts("ntf-1").await.expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0]
            .error_detail
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
    }
}
