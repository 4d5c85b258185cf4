use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BoxError;

/// Result type for store round-trips. Implementations surface their own
/// error types boxed; the scheduler wraps them in
/// [`Error::Store`](crate::Error::Store).
pub type StoreResult<T> = std::result::Result<T, BoxError>;

/// How many fields [`Store::hget_all`] asks for per scan page.
pub const SCAN_PAGE: usize = 1000;

/// Callback invoked when a watched key expires inside the store.
pub type ExpiryCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Durable key-value capability consumed by the scheduler: a mapping of
/// mappings with field-level access plus an atomic set-if-absent used for
/// the recovery lock.
///
/// Implementations must be safe to share across tasks. Only [`set_nx`]
/// is required to be atomic; no cross-key ordering is assumed.
///
/// [`set_nx`]: Store::set_nx
#[async_trait]
pub trait Store: Send + Sync {
    /// Read one field of a hash. Returns `Ok(None)` when the field is
    /// absent; absence is not an error.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Write one field of a hash, creating the hash if needed.
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Delete one field of a hash. Deleting an absent field is a no-op.
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()>;

    /// Scan one page of a hash starting at `cursor`. Returns the next
    /// cursor (0 when the scan is complete) and up to `count` field/value
    /// pairs. Callers iterate pages so an arbitrarily large hash is never
    /// materialised at once.
    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<(String, String)>)>;

    /// Set `key` to `value` only if it does not exist, with an expiry.
    /// Returns `true` iff this call created the key. This is the mutual
    /// exclusion primitive behind the recovery lock.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a top-level key (and its hash contents, if any).
    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Read every field of a hash. Provided as a paged loop over
    /// [`hscan`](Store::hscan).
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut all = HashMap::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.hscan(key, cursor, SCAN_PAGE).await?;
            all.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(all)
    }
}

/// Optional store capability: push-style notification of key expiry.
///
/// Stores backed by an engine with expiry events (e.g. keyspace
/// notifications) expose them here as an observer registration. The
/// scheduler itself does not consume this: its own timer engine is the
/// source of truth for firing. It is offered as an alternate trigger
/// source for callers that want store-driven firing instead.
pub trait ExpiryEvents {
    /// Register `callback` to run whenever `key` expires. Multiple
    /// callbacks per key are invoked in registration order.
    fn on_key_expired(&self, key: &str, callback: ExpiryCallback);
}
