//! Notification dispatch path: cap-checked, fallback-capable,
//! asynchronously-reconciled delivery through interchangeable providers.
//!
//! All mutable caches are owned by long-lived service values constructed at
//! process start; nothing here keeps ambient global state, so tests can
//! always build an isolated instance.

use std::sync::Arc;

pub mod audit;
pub mod cache;
pub mod fallback;
pub mod provider;
pub mod registry;
pub mod service;
pub mod template;

pub use audit::{AuditJob, AuditMetricsSnapshot, AuditSink};
pub use cache::TimedCache;
pub use fallback::{DispatchExhausted, DispatchSuccess, FallbackDispatcher};
pub use provider::{
    DispatchEnvelope, DispatchProvider, HttpEmailProvider, HttpProviderFactory, ProviderCallError,
    ProviderFactory, ProviderReceipt,
};
pub use registry::ProviderRegistry;
pub use service::{
    NotificationDispatchConfig, NotificationReceipt, NotificationService, NotifyError,
};
pub use template::{render_template, unresolved_placeholders, RenderedMessage, TemplateCatalog};

/// Injectable clock returning Unix milliseconds; production uses
/// [`sente_core::current_unix_timestamp_ms`].
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Optional structured observability sink for dispatch events.
pub type DispatchEventSink = Arc<dyn Fn(serde_json::Value) + Send + Sync>;
