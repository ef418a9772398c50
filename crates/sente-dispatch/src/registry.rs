//! Prioritized provider registry with a read-through TTL cache over the
//! durable store's configuration rows.

use crate::cache::TimedCache;
use crate::ClockFn;
use sente_core::current_unix_timestamp_ms;
use sente_store::{LedgerStore, StoreResult};
use sente_types::{ProviderDescriptor, ProviderKind};
use std::sync::Arc;

/// Caches the provider list per kind. Provider config changes rarely, so the
/// list lives longer than budget state; explicit config writes invalidate
/// the cache immediately rather than waiting out the TTL.
pub struct ProviderRegistry {
    store: Arc<dyn LedgerStore>,
    cache: TimedCache<Vec<ProviderDescriptor>>,
    clock: ClockFn,
}

impl ProviderRegistry {
    pub fn new(store: Arc<dyn LedgerStore>, ttl_ms: u64) -> Self {
        Self::new_with_clock(store, ttl_ms, Arc::new(current_unix_timestamp_ms))
    }

    pub(crate) fn new_with_clock(
        store: Arc<dyn LedgerStore>,
        ttl_ms: u64,
        clock: ClockFn,
    ) -> Self {
        Self {
            store,
            cache: TimedCache::new(ttl_ms),
            clock,
        }
    }

    /// Enabled providers of `kind`, priority ascending (lowest tried first).
    pub async fn routes(&self, kind: ProviderKind) -> StoreResult<Vec<ProviderDescriptor>> {
        let now_unix_ms = (self.clock)();
        let key = kind.as_str();
        let all = match self.cache.get(key, now_unix_ms) {
            Some(cached) => cached,
            None => {
                let loaded = self.store.list_providers(kind).await?;
                self.cache.put(key, loaded.clone(), now_unix_ms);
                loaded
            }
        };
        Ok(all
            .into_iter()
            .filter(|descriptor| descriptor.enabled)
            .collect())
    }

    pub async fn upsert_provider(&self, descriptor: ProviderDescriptor) -> StoreResult<()> {
        let key = descriptor.kind.as_str();
        self.store.upsert_provider(descriptor).await?;
        self.cache.invalidate(key);
        Ok(())
    }

    /// Flips a provider's enabled flag and drops the whole cache; the row's
    /// kind is not known here and there are only two artifact classes.
    pub async fn set_provider_enabled(
        &self,
        provider_id: &str,
        enabled: bool,
    ) -> StoreResult<()> {
        self.store
            .set_provider_enabled(provider_id, enabled)
            .await?;
        self.cache.clear();
        Ok(())
    }
}
