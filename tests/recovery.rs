//! Crash-recovery round trip through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use timewatch::{Error, MemoryStore, Options, Store, TimeWatch, Watch};

fn options(namespace: &str) -> Options {
    let mut options = Options::new(namespace);
    options.buckets = 16;
    options
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_outstanding_watches() {
    let store = Arc::new(MemoryStore::new());

    // First life of the service: two watches, one fires, then a crash.
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let scheduler = TimeWatch::new(store.clone(), options("svc")).unwrap();
        let hits = fired.clone();
        scheduler
            .register(Duration::from_secs(2), Watch::new("quick"), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        scheduler
            .register(
                Duration::from_secs(60),
                Watch::with_attributes("slow", json!({"attempt": 3})),
                || unreachable!("lost in the crash"),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // the fired watch cleaned up after itself; the slow one survives
        assert_eq!(store.hget("svc", "quick").await.unwrap(), None);
        assert!(store.hget("svc", "slow").await.unwrap().is_some());

        scheduler.shutdown();
    }

    // Second life: recover re-arms the survivor for its remaining delay
    // and the payload comes back verbatim.
    let scheduler = TimeWatch::new(store.clone(), options("svc")).unwrap();
    let recovered: Arc<Mutex<Vec<Watch>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = recovered.clone();
    scheduler
        .recover(move |watch| {
            seen.lock().unwrap().push(watch);
        })
        .await
        .unwrap();

    assert_eq!(store.hget("svc", "slow").await.unwrap(), None);
    assert!(recovered.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;

    let seen = recovered.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].field, "slow");
    assert_eq!(seen[0].customized_attributes, json!({"attempt": 3}));
}

#[tokio::test(start_paused = true)]
async fn concurrent_recovery_is_locked_out_until_the_ttl_expires() {
    let store = Arc::new(MemoryStore::new());
    let mut overdue = Watch::new("pending");
    overdue.touch_off_unix = unix_now() - 5;
    store
        .hset("svc", "pending", &overdue.encode().unwrap())
        .await
        .unwrap();

    // A rival instance grabbed the lock and crashed without releasing it.
    let mut opts = options("svc");
    opts.lock_ttl = Duration::from_secs(30);
    assert!(store
        .set_nx("svc:lock", "LOCKED", Duration::from_secs(30))
        .await
        .unwrap());

    let scheduler = TimeWatch::new(store.clone(), opts).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let seen = hits.clone();
    let result = scheduler
        .recover(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert!(matches!(result, Err(Error::LockHeld)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(store.hget("svc", "pending").await.unwrap().is_some());

    // The crashed holder's lock self-expires; recovery then proceeds.
    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    let seen = hits.clone();
    scheduler
        .recover(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(store.hget("svc", "pending").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn drain_clears_stale_state_without_callbacks() {
    let store = Arc::new(MemoryStore::new());
    for field in ["a", "b", "c"] {
        let mut watch = Watch::new(field);
        watch.touch_off_unix = unix_now() + 120;
        store
            .hset("svc", field, &watch.encode().unwrap())
            .await
            .unwrap();
    }

    let scheduler = TimeWatch::new(store.clone(), options("svc")).unwrap();
    assert_eq!(scheduler.drain().await.unwrap(), 3);

    for field in ["a", "b", "c"] {
        assert_eq!(store.hget("svc", field).await.unwrap(), None);
    }

    // the namespace lock is released again afterwards
    assert_eq!(scheduler.drain().await.unwrap(), 0);
}
