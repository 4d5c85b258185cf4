use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::store::{ExpiryCallback, ExpiryEvents, Store, StoreResult};

/// In-process [`Store`] implementation.
///
/// The reference store for tests, demos and single-process deployments:
/// a hash-of-hashes for watch records plus a flat keyspace for the
/// recovery lock. Cheap to clone; clones share the same data.
///
/// `set_nx` TTLs are honoured by a spawned expiry task, so lock
/// self-expiry behaves as it would against a networked store, and
/// [`ExpiryEvents`] observers are notified when a key expires.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
    observers: Arc<Mutex<HashMap<String, Vec<Arc<dyn Fn(&str) + Send + Sync>>>>>,
}

#[derive(Default)]
struct Shared {
    /// key -> field -> value. BTreeMap keeps scan order deterministic.
    hashes: HashMap<String, BTreeMap<String, String>>,
    /// Flat keyspace used by `set_nx` / `del`.
    keys: HashMap<String, KeyEntry>,
    /// Monotonic; never reused even after keys are deleted.
    next_generation: u64,
}

struct KeyEntry {
    value: String,
    /// Bumped on every create so a stale expiry task cannot remove a key
    /// that was deleted and re-created in the meantime.
    generation: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire(&self, key: &str, generation: u64) {
        let removed = {
            let mut shared = self.shared.lock().unwrap();
            let current = shared.keys.get(key).map(|entry| entry.generation);
            if current == Some(generation) {
                shared.keys.remove(key);
                true
            } else {
                false
            }
        };
        if !removed {
            return;
        }
        log::debug!("memory store key '{key}' expired");
        let callbacks = {
            let observers = self.observers.lock().unwrap();
            observers.get(key).cloned().unwrap_or_default()
        };
        for callback in callbacks {
            callback(key);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let shared = self.shared.lock().unwrap();
        Ok(shared
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut shared = self.shared.lock().unwrap();
        shared
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut shared = self.shared.lock().unwrap();
        let emptied = match shared.hashes.get_mut(key) {
            Some(hash) => {
                hash.remove(field);
                hash.is_empty()
            }
            None => false,
        };
        if emptied {
            shared.hashes.remove(key);
        }
        Ok(())
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<(String, String)>)> {
        let shared = self.shared.lock().unwrap();
        let Some(hash) = shared.hashes.get(key) else {
            return Ok((0, Vec::new()));
        };
        let page: Vec<(String, String)> = hash
            .iter()
            .skip(cursor as usize)
            .take(count)
            .map(|(f, v)| (f.clone(), v.clone()))
            .collect();
        let consumed = cursor as usize + page.len();
        let next = if consumed >= hash.len() {
            0
        } else {
            consumed as u64
        };
        Ok((next, page))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let generation = {
            let mut shared = self.shared.lock().unwrap();
            if shared.keys.contains_key(key) {
                return Ok(false);
            }
            shared.next_generation += 1;
            let generation = shared.next_generation;
            shared.keys.insert(
                key.to_string(),
                KeyEntry {
                    value: value.to_string(),
                    generation,
                },
            );
            generation
        };

        let store = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            store.expire(&key, generation);
        });
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.keys.remove(key);
        shared.hashes.remove(key);
        Ok(())
    }
}

impl ExpiryEvents for MemoryStore {
    fn on_key_expired(&self, key: &str, callback: ExpiryCallback) {
        let mut observers = self.observers.lock().unwrap();
        observers
            .entry(key.to_string())
            .or_default()
            .push(Arc::from(callback));
    }
}

impl MemoryStore {
    /// Current value of a flat key, if present. Test/diagnostic helper.
    pub fn get(&self, key: &str) -> Option<String> {
        let shared = self.shared.lock().unwrap();
        shared.keys.get(key).map(|e| e.value.clone())
    }
}
