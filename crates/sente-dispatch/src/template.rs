//! Message template resolution with placeholder substitution and its own
//! read-through TTL cache.

use crate::cache::TimedCache;
use crate::ClockFn;
use sente_core::current_unix_timestamp_ms;
use sente_store::{LedgerStore, StoreResult};
use sente_types::MessageTemplate;
use std::collections::HashMap;
use std::sync::Arc;

/// Subject/body pair after placeholder substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Substitutes `{name}` tokens in subject and body.
///
/// Unknown tokens render literally; `unresolved_placeholders` surfaces them
/// for config validation without making dispatch brittle.
pub fn render_template(
    template: &MessageTemplate,
    placeholders: &HashMap<String, String>,
) -> RenderedMessage {
    let mut subject = template.subject.clone();
    let mut body = template.body.clone();
    for (name, value) in placeholders {
        let token = format!("{{{name}}}");
        subject = subject.replace(&token, value);
        body = body.replace(&token, value);
    }
    RenderedMessage { subject, body }
}

/// Returns the `{name}` tokens still present in `text`, in order of first
/// appearance. Only simple identifier tokens count; stray braces are ignored.
pub fn unresolved_placeholders(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] != b'{' {
            index += 1;
            continue;
        }
        let start = index + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if end > start && end < bytes.len() && bytes[end] == b'}' {
            let name = text[start..end].to_string();
            if !found.contains(&name) {
                found.push(name);
            }
            index = end + 1;
        } else {
            index = start;
        }
    }
    found
}

/// Read-through template cache keyed by logical message kind.
pub struct TemplateCatalog {
    store: Arc<dyn LedgerStore>,
    cache: TimedCache<MessageTemplate>,
    clock: ClockFn,
}

impl TemplateCatalog {
    pub fn new(store: Arc<dyn LedgerStore>, ttl_ms: u64) -> Self {
        Self::new_with_clock(store, ttl_ms, Arc::new(current_unix_timestamp_ms))
    }

    fn new_with_clock(store: Arc<dyn LedgerStore>, ttl_ms: u64, clock: ClockFn) -> Self {
        Self {
            store,
            cache: TimedCache::new(ttl_ms),
            clock,
        }
    }

    pub async fn resolve(&self, message_kind: &str) -> StoreResult<MessageTemplate> {
        let now_unix_ms = (self.clock)();
        if let Some(template) = self.cache.get(message_kind, now_unix_ms) {
            return Ok(template);
        }
        let template = self.store.get_template(message_kind).await?;
        self.cache
            .put(message_kind.to_string(), template.clone(), now_unix_ms);
        Ok(template)
    }

    /// Writes through to the store and drops the cached copy immediately so
    /// the next dispatch sees the new content.
    pub async fn upsert(&self, template: MessageTemplate) -> StoreResult<()> {
        let message_kind = template.message_kind.clone();
        self.store.upsert_template(template).await?;
        self.cache.invalidate(&message_kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sente_store::InMemoryLedgerStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn template(subject: &str, body: &str) -> MessageTemplate {
        MessageTemplate {
            message_kind: "dividend_paid".to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn unit_render_substitutes_known_tokens_and_keeps_unknown() {
        let rendered = render_template(
            &template(
                "Dividend of {amount} {currency}",
                "Hello {name}, {missing} stays.",
            ),
            &HashMap::from([
                ("amount".to_string(), "1200".to_string()),
                ("currency".to_string(), "UGX".to_string()),
                ("name".to_string(), "Akello".to_string()),
            ]),
        );
        assert_eq!(rendered.subject, "Dividend of 1200 UGX");
        assert_eq!(rendered.body, "Hello Akello, {missing} stays.");
    }

    #[test]
    fn unit_unresolved_placeholders_reports_simple_tokens_once() {
        let found = unresolved_placeholders("{a} and {a} and {b_2} but not { spaced } or {");
        assert_eq!(found, vec!["a".to_string(), "b_2".to_string()]);
    }

    #[tokio::test]
    async fn functional_catalog_caches_until_ttl_and_invalidates_on_write() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .upsert_template(template("first subject", "body"))
            .await
            .expect("seed template");

        let now_ms = Arc::new(AtomicU64::new(10_000));
        let clock: ClockFn = {
            let now_ms = now_ms.clone();
            Arc::new(move || now_ms.load(Ordering::Relaxed))
        };
        let catalog = TemplateCatalog::new_with_clock(store.clone(), 1_000, clock);

        let first = catalog.resolve("dividend_paid").await.expect("resolve");
        assert_eq!(first.subject, "first subject");

        // A raw store write without invalidation stays invisible inside the
        // TTL window.
        store
            .upsert_template(template("second subject", "body"))
            .await
            .expect("raw write");
        let cached = catalog.resolve("dividend_paid").await.expect("cached");
        assert_eq!(cached.subject, "first subject");

        // A catalog write invalidates immediately.
        catalog
            .upsert(template("third subject", "body"))
            .await
            .expect("catalog write");
        let fresh = catalog.resolve("dividend_paid").await.expect("fresh");
        assert_eq!(fresh.subject, "third subject");

        // And TTL expiry alone also refreshes.
        store
            .upsert_template(template("fourth subject", "body"))
            .await
            .expect("raw write two");
        now_ms.store(12_000, Ordering::Relaxed);
        let expired = catalog.resolve("dividend_paid").await.expect("expired");
        assert_eq!(expired.subject, "fourth subject");
    }
}
