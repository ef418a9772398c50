use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique correlation id of the form
/// `<prefix>-<unix_millis>-<counter>`.
///
/// Used as dispatch ids, transaction ids, and attempt ids so that audit rows
/// written by different workers never collide within one process lifetime.
pub fn new_correlation_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let count = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{millis}-{count}")
}
