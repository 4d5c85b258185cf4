use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::record::Watch;
use crate::store::{Store, SCAN_PAGE};
use crate::wheel::{TimerHandle, TimerWheel, Trigger, WheelHandle, DEFAULT_BUCKETS, DEFAULT_TICK};

/// Value stored under the recovery lock key.
const LOCK_VALUE: &str = "LOCKED";

/// Suffix appended to the namespace to form the lock key.
const LOCK_SUFFIX: &str = ":lock";

// Per-slot lifecycle tag. A slot moves armed -> firing -> done exactly
// once; stop and the fire path arbitrate via compare-and-swap so the
// durable delete happens on one side only.
const ARMED: u8 = 0;
const FIRING: u8 = 1;
const DONE: u8 = 2;

/// Configuration for a [`TimeWatch`] instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// Storage namespace. Forms the record hash key and the recovery lock
    /// key; two instances must never share one. Required non-empty.
    pub namespace: String,

    /// Whether a watch found already past due during recovery fires
    /// immediately instead of being dropped. Defaults to `true`.
    pub fire_overdue: bool,

    /// Recovery lock expiry, so a crashed holder cannot wedge recovery
    /// forever. Defaults to 60 seconds.
    pub lock_ttl: Duration,

    /// Timer wheel resolution. Defaults to 1 second.
    pub tick: Duration,

    /// Timer wheel slot count. Defaults to 360.
    pub buckets: usize,
}

impl Options {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            fire_overdue: true,
            lock_ttl: Duration::from_secs(60),
            tick: DEFAULT_TICK,
            buckets: DEFAULT_BUCKETS,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new("")
    }
}

/// Crash-recoverable delayed-action scheduler.
///
/// Each registered watch is persisted to the [`Store`] before its timer is
/// armed, so a process restart can rediscover outstanding watches via
/// [`recover`](TimeWatch::recover). Clones share one instance.
#[derive(Clone)]
pub struct TimeWatch {
    inner: Arc<Inner>,
}

struct Inner {
    namespace: String,
    store: Arc<dyn Store>,
    fire_overdue: bool,
    lock_ttl: Duration,
    wheel: WheelHandle,
    /// Live watches by field name.
    timers: Mutex<HashMap<String, WatchSlot>>,
    //// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

/// One live watch: its engine timer plus the shared lifecycle tag.
#[derive(Clone)]
struct WatchSlot {
    state: Arc<AtomicU8>,
    timer: TimerHandle,
}

/// Handle returned by [`TimeWatch::register`], usable to stop or reset the
/// watch without going back through the scheduler by name.
pub struct WatchHandle {
    field: String,
    scheduler: TimeWatch,
}

impl Inner {
    fn hash_key(&self) -> &str {
        &self.namespace
    }

    fn lock_key(&self) -> String {
        format!("{}{LOCK_SUFFIX}", self.namespace)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl TimeWatch {
    /// Create a scheduler over `store`.
    ///
    /// Spawns the timer wheel onto the current tokio runtime, so this must
    /// be called from within one. Fails with [`Error::EmptyNamespace`]
    /// when no namespace is configured.
    pub fn new(store: Arc<dyn Store>, options: Options) -> Result<Self> {
        if options.namespace.is_empty() {
            return Err(Error::EmptyNamespace);
        }

        let cancel_token = CancellationToken::new();
        let (wheel, handle) = TimerWheel::new(options.tick, options.buckets, cancel_token.clone());
        tokio::spawn(wheel.run());

        Ok(Self {
            inner: Arc::new(Inner {
                namespace: options.namespace,
                store,
                fire_overdue: options.fire_overdue,
                lock_ttl: options.lock_ttl,
                wheel: handle,
                timers: Mutex::new(HashMap::new()),
                cancel_token,
            }),
        })
    }

    /// Register a watch: persist its record, then arm a timer that fires
    /// `callback` after `delay`.
    ///
    /// A zero `touch_off_unix` on `watch` is computed as now + `delay`.
    /// The record is written before the timer is armed; a store failure
    /// aborts the registration with no timer armed. When the timer fires,
    /// the record is deleted first and `callback` runs afterwards, on its
    /// own task.
    ///
    /// Registering a name that is already live replaces it: the previous
    /// timer is cancelled before the new record is written.
    pub async fn register<F>(&self, delay: Duration, mut watch: Watch, callback: F) -> Result<WatchHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if watch.field.is_empty() {
            return Err(Error::EmptyField);
        }
        if watch.touch_off_unix == 0 {
            watch.touch_off_unix = unix_now() + delay.as_secs() as i64;
        }
        let field = watch.field.clone();

        // Retire any previous registration under this name first, so a
        // stale timer cannot fire against the record written below.
        let previous = self.inner.timers.lock().unwrap().remove(&field);
        if let Some(prev) = previous {
            self.retire(prev, &field).await;
        }

        let encoded = watch.encode()?;
        self.inner
            .store
            .hset(self.inner.hash_key(), &field, &encoded)
            .await
            .map_err(Error::Store)?;

        let state = Arc::new(AtomicU8::new(ARMED));
        let trigger: Trigger = {
            let inner = Arc::clone(&self.inner);
            let state = Arc::clone(&state);
            let field = field.clone();
            Box::new(move || {
                async move {
                    // A racing stop may have claimed the slot already.
                    if state
                        .compare_exchange(ARMED, FIRING, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return;
                    }
                    if let Err(e) = inner.store.hdel(inner.hash_key(), &field).await {
                        log::warn!("fired watch '{field}': record delete failed: {e}");
                    }
                    // Drop the slot only if it is still this registration.
                    {
                        let mut timers = inner.timers.lock().unwrap();
                        if let Some(slot) = timers.get(&field) {
                            if Arc::ptr_eq(&slot.state, &state) {
                                timers.remove(&field);
                            }
                        }
                    }
                    state.store(DONE, Ordering::Release);
                    log::debug!("watch '{field}' fired");
                    callback();
                }
                .boxed()
            })
        };

        let timer = match self.inner.wheel.schedule(delay, trigger).await {
            Ok(timer) => timer,
            Err(e) => {
                // No timer was armed; leave no durable trace either.
                if let Err(del) = self.inner.store.hdel(self.inner.hash_key(), &field).await {
                    log::warn!("rollback of watch '{field}' failed: {del}");
                }
                return Err(e);
            }
        };

        let slot = WatchSlot { state, timer };
        let displaced = self.inner.timers.lock().unwrap().insert(field.clone(), slot);
        if let Some(displaced) = displaced {
            // A concurrent register of the same name slipped in between
            // the removal above and this insert.
            self.retire(displaced, &field).await;
        }

        log::debug!("watch '{field}' registered, fires in {delay:?}");
        Ok(WatchHandle {
            field,
            scheduler: self.clone(),
        })
    }

    /// Push a live watch's deadline out to now + `new_delay`, updating the
    /// durable record and the timer together.
    ///
    /// Returns `Ok(false)` when the name is unknown or the watch is
    /// already firing; that is not an error, the watch may simply have
    /// fired. A store failure aborts the reset with the timer untouched,
    /// so the record and the timer never diverge.
    pub async fn reset(&self, field: &str, new_delay: Duration) -> Result<bool> {
        let slot = { self.inner.timers.lock().unwrap().get(field).cloned() };
        let Some(slot) = slot else {
            return Ok(false);
        };
        if slot.state.load(Ordering::Acquire) != ARMED {
            return Ok(false);
        }

        let raw = self
            .inner
            .store
            .hget(self.inner.hash_key(), field)
            .await
            .map_err(Error::Store)?;
        let Some(raw) = raw else {
            // Record already drained by a fire that beat us here.
            return Ok(false);
        };

        let mut watch = Watch::decode(&raw)?;
        watch.touch_off_unix = unix_now() + new_delay.as_secs() as i64;
        let encoded = watch.encode()?;
        self.inner
            .store
            .hset(self.inner.hash_key(), field, &encoded)
            .await
            .map_err(Error::Store)?;

        Ok(slot.timer.reschedule(new_delay).await)
    }

    /// Stop a live watch: cancel its timer and delete its record.
    ///
    /// Unknown names are a no-op (`Ok(false)`), as is a watch whose fire
    /// is already in flight; the fire path performs its own record delete,
    /// so the two sides are idempotent against each other.
    pub async fn stop(&self, field: &str) -> Result<bool> {
        let slot = { self.inner.timers.lock().unwrap().remove(field) };
        let Some(slot) = slot else {
            return Ok(false);
        };
        if slot
            .state
            .compare_exchange(ARMED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        slot.timer.cancel().await;
        self.inner
            .store
            .hdel(self.inner.hash_key(), field)
            .await
            .map_err(Error::Store)?;
        log::debug!("watch '{field}' stopped");
        Ok(true)
    }

    /// Resume watches that survived a restart.
    ///
    /// Call once at service start. Acquires the namespace recovery lock;
    /// if another instance holds it this returns [`Error::LockHeld`] and
    /// performs no work (retry after the lock TTL). Each surviving record
    /// is deleted first — a crash during replay loses it rather than
    /// firing it twice — then either re-armed for its remaining delay or,
    /// when already overdue, handed to `callback` immediately (only if
    /// `fire_overdue` is set; otherwise overdue watches are dropped).
    ///
    /// Recovered watches are fire-only: they have no live slot, so
    /// [`stop`](Self::stop) and [`reset`](Self::reset) on them report
    /// `Ok(false)`.
    pub async fn recover<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(Watch) + Send + Sync + 'static,
    {
        self.acquire_lock().await?;
        let result = self.replay(Arc::new(callback)).await;
        self.release_lock().await;
        result
    }

    /// Degraded recovery for services that discard orphaned watches on
    /// restart: acquires the same lock, deletes every surviving record,
    /// re-arms nothing. Returns the number of records discarded.
    pub async fn drain(&self) -> Result<usize> {
        self.acquire_lock().await?;
        let result = self.drain_records().await;
        self.release_lock().await;
        if let Ok(n) = &result {
            if *n > 0 {
                log::info!("drained {n} stale watch record(s)");
            }
        }
        result
    }

    /// Shut the timer engine down. Armed timers never fire afterwards and
    /// operations that need the engine return [`Error::EngineClosed`].
    /// Dropping the last clone of the scheduler has the same effect.
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    async fn replay(&self, callback: Arc<dyn Fn(Watch) + Send + Sync>) -> Result<()> {
        let key = self.inner.hash_key().to_string();
        loop {
            // Every record in the page is drained below, so each scan
            // restarts from the head; the loop ends once the hash is empty.
            let (_, page) = self
                .inner
                .store
                .hscan(&key, 0, SCAN_PAGE)
                .await
                .map_err(Error::Store)?;
            if page.is_empty() {
                return Ok(());
            }

            for (field, raw) in page {
                self.inner
                    .store
                    .hdel(&key, &field)
                    .await
                    .map_err(Error::Store)?;

                let watch = match Watch::decode(&raw) {
                    Ok(watch) => watch,
                    Err(e) => {
                        // One corrupt record must not sink the whole batch.
                        log::warn!("skipping undecodable watch record '{field}': {e}");
                        continue;
                    }
                };

                let remaining = watch.touch_off_unix - unix_now();
                if remaining > 0 {
                    let callback = Arc::clone(&callback);
                    let trigger: Trigger = Box::new(move || {
                        async move {
                            callback(watch);
                        }
                        .boxed()
                    });
                    self.inner
                        .wheel
                        .schedule(Duration::from_secs(remaining as u64), trigger)
                        .await?;
                    log::info!("watch '{field}' re-armed, fires in {remaining}s");
                } else if self.inner.fire_overdue {
                    log::info!("watch '{field}' overdue, firing during recovery");
                    callback(watch);
                } else {
                    log::debug!("watch '{field}' overdue, dropped");
                }
            }
        }
    }

    async fn drain_records(&self) -> Result<usize> {
        let key = self.inner.hash_key().to_string();
        let mut discarded = 0;
        loop {
            let (_, page) = self
                .inner
                .store
                .hscan(&key, 0, SCAN_PAGE)
                .await
                .map_err(Error::Store)?;
            if page.is_empty() {
                return Ok(discarded);
            }
            for (field, _) in page {
                self.inner
                    .store
                    .hdel(&key, &field)
                    .await
                    .map_err(Error::Store)?;
                discarded += 1;
            }
        }
    }

    async fn acquire_lock(&self) -> Result<()> {
        let created = self
            .inner
            .store
            .set_nx(&self.inner.lock_key(), LOCK_VALUE, self.inner.lock_ttl)
            .await
            .map_err(Error::Store)?;
        if !created {
            return Err(Error::LockHeld);
        }
        Ok(())
    }

    async fn release_lock(&self) {
        if let Err(e) = self.inner.store.del(&self.inner.lock_key()).await {
            log::warn!("recovery lock release failed, it will self-expire: {e}");
        }
    }

    /// Cancel a slot displaced by a re-registration. If its fire is
    /// already in flight, the fire path keeps ownership of cleanup.
    async fn retire(&self, slot: WatchSlot, field: &str) {
        if slot
            .state
            .compare_exchange(ARMED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            slot.timer.cancel().await;
            log::debug!("watch '{field}' re-registered, previous timer dropped");
        }
    }
}

impl WatchHandle {
    /// Name of the registered watch.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// See [`TimeWatch::stop`].
    pub async fn stop(&self) -> Result<bool> {
        self.scheduler.stop(&self.field).await
    }

    /// See [`TimeWatch::reset`].
    pub async fn reset(&self, new_delay: Duration) -> Result<bool> {
        self.scheduler.reset(&self.field, new_delay).await
    }
}
