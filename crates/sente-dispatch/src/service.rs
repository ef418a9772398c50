//! Caller-facing notification dispatch service.
//!
//! Owns the provider registry, template catalog, budget cache, fallback
//! dispatcher, and audit sink as explicit state, constructed once at process
//! start. The synchronous portion runs cap check through dispatch loop and
//! returns; audit and budget reconciliation detach through the sink.

use anyhow::{anyhow, Result};

use crate::audit::AuditSink;
use crate::cache::TimedCache;
use crate::fallback::FallbackDispatcher;
use crate::provider::{
    DispatchEnvelope, DispatchProvider, HttpProviderFactory, ProviderFactory,
};
use crate::registry::ProviderRegistry;
use crate::template::{render_template, TemplateCatalog};
use crate::{ClockFn, DispatchEventSink};
use sente_core::{current_unix_timestamp_ms, new_correlation_id};
use sente_ledger::{admit_budget, AdmissionError};
use sente_store::{LedgerStore, LedgerStoreError};
use sente_types::{
    AttemptOutcome, AttemptRecord, BudgetState, NotificationRequest, ProviderKind,
};
use std::sync::Arc;
use thiserror::Error;

/// Tunables for the notification path. Budget state is the shortest-lived
/// cache entry since it moves on every dispatch; provider and template
/// config change rarely and live longer.
#[derive(Debug, Clone)]
pub struct NotificationDispatchConfig {
    pub attempt_timeout_ms: u64,
    pub budget_cache_ttl_ms: u64,
    pub provider_cache_ttl_ms: u64,
    pub template_cache_ttl_ms: u64,
    pub audit_queue_limit: usize,
}

impl Default for NotificationDispatchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 10_000,
            budget_cache_ttl_ms: 60_000,
            provider_cache_ttl_ms: 300_000,
            template_cache_ttl_ms: 600_000,
            audit_queue_limit: 256,
        }
    }
}

/// Successful dispatch as reported to the caller. This acknowledges
/// provider acceptance, not ultimate delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationReceipt {
    pub dispatch_id: String,
    pub provider_id: String,
    pub cost_minor: u64,
    pub provider_message_id: String,
    pub attempts_tried: usize,
}

/// Caller-visible failures of the notification path.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("dispatch reference '{0}' already used")]
    DuplicateReference(String),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("template '{0}' not found")]
    TemplateNotFound(String),
    #[error("no enabled providers configured for kind '{kind}'", kind = .kind.as_str())]
    NoProvidersConfigured { kind: ProviderKind },
    #[error("all {attempts_tried} provider attempts failed; last error: {last_error}")]
    AllProvidersFailed {
        attempts_tried: usize,
        last_error: String,
    },
    #[error(transparent)]
    Store(#[from] LedgerStoreError),
}

/// Long-lived notification dispatch service.
pub struct NotificationService {
    store: Arc<dyn LedgerStore>,
    config: NotificationDispatchConfig,
    registry: ProviderRegistry,
    templates: TemplateCatalog,
    budgets: TimedCache<BudgetState>,
    audit: AuditSink,
    factory: Arc<dyn ProviderFactory>,
    dispatcher: FallbackDispatcher,
    clock: ClockFn,
}

impl NotificationService {
    /// Builds the service and spawns its audit writer; must be called from
    /// within a tokio runtime.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: NotificationDispatchConfig,
    ) -> Result<Self> {
        if config.attempt_timeout_ms == 0 {
            return Err(anyhow!("notification dispatch requires attempt timeout > 0"));
        }
        if config.audit_queue_limit == 0 {
            return Err(anyhow!("notification dispatch requires audit queue limit > 0"));
        }

        let clock: ClockFn = Arc::new(current_unix_timestamp_ms);
        Ok(Self {
            registry: ProviderRegistry::new(store.clone(), config.provider_cache_ttl_ms),
            templates: TemplateCatalog::new(store.clone(), config.template_cache_ttl_ms),
            budgets: TimedCache::new(config.budget_cache_ttl_ms),
            audit: AuditSink::spawn(store.clone(), config.audit_queue_limit),
            factory: Arc::new(HttpProviderFactory::new(config.attempt_timeout_ms)),
            dispatcher: FallbackDispatcher::new(config.attempt_timeout_ms),
            store,
            config,
            clock,
        })
    }

    pub fn with_provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_event_sink(mut self, event_sink: DispatchEventSink) -> Self {
        self.dispatcher =
            FallbackDispatcher::with_event_sink(self.config.attempt_timeout_ms, event_sink);
        self
    }

    /// Registry handle for provider config writes (which invalidate the
    /// route cache immediately).
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Template catalog handle for content config writes.
    pub fn templates(&self) -> &TemplateCatalog {
        &self.templates
    }

    /// Audit sink handle, exposed for flush-on-shutdown and monitoring.
    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Dispatches one notification: cap check, template render, provider
    /// fallback, immediate response. Audit rows and the budget charge are
    /// applied asynchronously after this returns.
    pub async fn dispatch(
        &self,
        request: NotificationRequest,
    ) -> Result<NotificationReceipt, NotifyError> {
        validate_request(&request)?;

        let routes = self.registry.routes(ProviderKind::Email).await?;
        if routes.is_empty() {
            return Err(NotifyError::NoProvidersConfigured {
                kind: ProviderKind::Email,
            });
        }

        // Admission is checked against the most expensive candidate route so
        // no fallback outcome can overshoot the cap.
        let admission_cost = routes
            .iter()
            .map(|descriptor| descriptor.unit_cost_minor)
            .max()
            .unwrap_or(0);
        let budget = self.load_budget(&request.scope).await?;
        admit_budget(&budget, admission_cost)?;

        let template = self
            .templates
            .resolve(&request.message_kind)
            .await
            .map_err(|error| match error {
                LedgerStoreError::TemplateNotFound(kind) => NotifyError::TemplateNotFound(kind),
                other => NotifyError::Store(other),
            })?;
        let rendered = render_template(&template, &request.placeholders);

        // Claim the idempotency reference only after every no-side-effect
        // check has passed: a rejected admission or missing template must
        // leave the reference free for the caller's retry.
        let dispatch_id = match &request.reference {
            Some(reference) => {
                self.store
                    .register_dispatch(reference)
                    .await
                    .map_err(|error| match error {
                        LedgerStoreError::DuplicateReference(reference) => {
                            NotifyError::DuplicateReference(reference)
                        }
                        other => NotifyError::Store(other),
                    })?;
                reference.clone()
            }
            None => new_correlation_id("ntf"),
        };

        let envelope = DispatchEnvelope {
            dispatch_id: dispatch_id.clone(),
            recipient: request.recipient.clone(),
            subject: rendered.subject,
            body: rendered.body,
        };

        let mut providers: Vec<Arc<dyn DispatchProvider>> = Vec::with_capacity(routes.len());
        let mut build_failures = 0usize;
        let mut last_build_error = String::new();
        for descriptor in &routes {
            match self.factory.build(descriptor) {
                Ok(provider) => providers.push(provider),
                Err(error) => {
                    // A provider that cannot even be constructed counts as a
                    // failed attempt, same as a refused send.
                    build_failures += 1;
                    last_build_error = error.to_string();
                    self.audit.record_attempt(AttemptRecord {
                        attempt_id: new_correlation_id("att"),
                        dispatch_id: dispatch_id.clone(),
                        provider_id: descriptor.provider_id.clone(),
                        outcome: AttemptOutcome::Failed,
                        cost_minor: 0,
                        provider_message_id: None,
                        error_detail: Some(error.to_string()),
                        created_unix_ms: (self.clock)(),
                    });
                }
            }
        }
        if providers.is_empty() {
            return Err(NotifyError::AllProvidersFailed {
                attempts_tried: build_failures,
                last_error: last_build_error,
            });
        }

        match self
            .dispatcher
            .dispatch(&envelope, &providers, &self.audit)
            .await
        {
            Ok(success) => {
                self.audit.record_budget_charge(
                    request.scope.clone(),
                    success.unit_cost_minor,
                    (self.clock)(),
                );
                // Drop the cached budget so the next admission re-reads the
                // charged counters instead of riding out the TTL.
                self.budgets.invalidate(&request.scope);
                Ok(NotificationReceipt {
                    dispatch_id,
                    provider_id: success.provider_id,
                    cost_minor: success.unit_cost_minor,
                    provider_message_id: success.provider_message_id,
                    attempts_tried: success.attempts_tried + build_failures,
                })
            }
            Err(exhausted) => Err(NotifyError::AllProvidersFailed {
                attempts_tried: exhausted.attempts_tried + build_failures,
                last_error: exhausted.last_error,
            }),
        }
    }

    async fn load_budget(&self, scope: &str) -> Result<BudgetState, NotifyError> {
        let now_unix_ms = (self.clock)();
        if let Some(state) = self.budgets.get(scope, now_unix_ms) {
            return Ok(state);
        }
        let state = self.store.get_budget(scope).await?;
        self.budgets.put(scope, state.clone(), now_unix_ms);
        Ok(state)
    }
}

fn validate_request(request: &NotificationRequest) -> Result<(), NotifyError> {
    if request.recipient.trim().is_empty() {
        return Err(NotifyError::InvalidRequest(
            "recipient must not be empty".to_string(),
        ));
    }
    if request.message_kind.trim().is_empty() {
        return Err(NotifyError::InvalidRequest(
            "message kind must not be empty".to_string(),
        ));
    }
    if request.scope.trim().is_empty() {
        return Err(NotifyError::InvalidRequest(
            "budget scope must not be empty".to_string(),
        ));
    }
    if matches!(&request.reference, Some(reference) if reference.trim().is_empty()) {
        return Err(NotifyError::InvalidRequest(
            "reference, when supplied, must not be empty".to_string(),
        ));
    }
    Ok(())
}
