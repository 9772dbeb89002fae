#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use herald_core::{DedupCache, Identity, Notification, Notifier, NotifyError, Signal, SignalKind, WatchedResource};
use herald_reconcile::{run_driver, DriverOptions, Reconciler, ReconcilerOptions};
use herald_store::MemoryStore;
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Notification>>,
    fail_next: AtomicUsize,
}

impl Recorder {
    fn messages(&self) -> Vec<String> { self.sent.lock().unwrap().iter().map(|n| n.message.clone()).collect() }
}

#[async_trait::async_trait]
impl Notifier for Recorder {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        if self.fail_next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1)).is_ok() {
            return Err(NotifyError::Rejected { status: 502 });
        }
        self.sent.lock().unwrap().push(n.clone());
        Ok(())
    }
}

fn resource(name: &str, generation: i64, ready: i32) -> WatchedResource {
    WatchedResource {
        identity: Identity::new("ns", name),
        uid: None,
        generation,
        desired_replicas: 2,
        ready_replicas: ready,
        observed_generation: generation,
        deleting: false,
        spec: serde_json::json!({ "replicas": 2 }),
    }
}

fn applied(name: &str) -> Signal { Signal { identity: Identity::new("ns", name), kind: SignalKind::Applied } }

fn fast() -> DriverOptions {
    DriverOptions {
        queue_cap: 64,
        workers: 2,
        tick: Duration::from_millis(5),
        retry_base: Duration::from_millis(10),
        retry_max: Duration::from_millis(50),
    }
}

fn setup() -> (Arc<MemoryStore>, Arc<Recorder>, Arc<Reconciler>) {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(Recorder::default());
    let rec = Arc::new(Reconciler::new(
        store.clone(),
        store.clone(),
        sink.clone(),
        Arc::new(DedupCache::new()),
        ReconcilerOptions::default(),
    ));
    (store, sink, rec)
}

async fn wait_for(sink: &Recorder, n: usize) {
    for _ in 0..200 {
        if sink.messages().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {} notifications, got {:?}", n, sink.messages());
}

#[tokio::test]
async fn burst_for_one_identity_is_coalesced() {
    let (store, sink, rec) = setup();
    store.put_resource(resource("a", 1, 2));
    let (tx, rx) = mpsc::channel(64);
    let driver = tokio::spawn(run_driver(rec, rx, fast()));
    for _ in 0..20 {
        tx.send(applied("a")).await.unwrap();
    }
    drop(tx);
    let stats = driver.await.unwrap();

    assert_eq!(sink.messages(), vec!["Created the deployment ns/a", "The deployment ns/a is ready."]);
    assert!(stats.invocations >= 1 && stats.invocations < 20, "stats={:?}", stats);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn failed_invocation_is_retried_with_backoff() {
    let (store, sink, rec) = setup();
    store.put_resource(resource("a", 1, 0));
    sink.fail_next.store(1, Ordering::SeqCst);
    let (tx, rx) = mpsc::channel(8);
    let driver = tokio::spawn(run_driver(rec, rx, fast()));
    tx.send(applied("a")).await.unwrap();

    // first Created send fails, the record is still written, and the retry finds
    // nothing left to send; readiness arrives afterwards
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.put_resource(resource("a", 1, 2));
    tx.send(applied("a")).await.unwrap();
    wait_for(&sink, 1).await;
    drop(tx);
    let stats = driver.await.unwrap();

    assert_eq!(sink.messages(), vec!["The deployment ns/a is ready."]);
    assert!(stats.failures >= 1, "stats={:?}", stats);
    assert!(stats.invocations >= 2, "stats={:?}", stats);
    assert!(store.record(&Identity::new("ns", "a")).is_some());
}

#[tokio::test]
async fn identities_are_handled_independently() {
    let (store, sink, rec) = setup();
    for name in ["a", "b", "c"] {
        store.put_resource(resource(name, 1, 0));
    }
    let (tx, rx) = mpsc::channel(8);
    let driver = tokio::spawn(run_driver(rec, rx, fast()));
    for name in ["a", "b", "c"] {
        tx.send(applied(name)).await.unwrap();
    }
    tx.send(Signal { identity: Identity::new("ns", "gone"), kind: SignalKind::Deleted }).await.unwrap();
    drop(tx);
    driver.await.unwrap();

    let mut msgs = sink.messages();
    msgs.sort();
    assert_eq!(
        msgs,
        vec![
            "Created the deployment ns/a",
            "Created the deployment ns/b",
            "Created the deployment ns/c",
            "The deployment ns/gone is deleted.",
        ]
    );
    assert_eq!(store.records().len(), 3);
}

/// Holds every send until `open` is called, tracking how many run at once.
#[derive(Default)]
struct Gate {
    closed: AtomicBool,
    release: Notify,
    entered: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    sent: Mutex<Vec<String>>,
}

impl Gate {
    fn shut() -> Self {
        let g = Self::default();
        g.closed.store(true, Ordering::SeqCst);
        g
    }

    fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
        self.release.notify_one();
    }

    async fn wait_entered(&self, n: usize) {
        for _ in 0..200 {
            if self.entered.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no send reached the gate");
    }
}

#[async_trait::async_trait]
impl Notifier for Gate {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(n.message.clone());
        Ok(())
    }
}

fn gated() -> (Arc<MemoryStore>, Arc<Gate>, Arc<Reconciler>) {
    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(Gate::shut());
    let rec = Arc::new(Reconciler::new(
        store.clone(),
        store.clone(),
        gate.clone(),
        Arc::new(DedupCache::new()),
        ReconcilerOptions::default(),
    ));
    (store, gate, rec)
}

#[tokio::test]
async fn signal_for_busy_identity_waits_behind_it() {
    let (store, gate, rec) = gated();
    store.put_resource(resource("a", 1, 0));
    let (tx, rx) = mpsc::channel(8);
    let driver = tokio::spawn(run_driver(rec, rx, fast()));
    tx.send(applied("a")).await.unwrap();
    gate.wait_entered(1).await;

    let mut next = resource("a", 2, 0);
    next.spec = serde_json::json!({ "replicas": 3 });
    store.put_resource(next);
    tx.send(applied("a")).await.unwrap();
    // plenty of ticks; the second pass must not start while the first is blocked
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(gate.entered.load(Ordering::SeqCst), 1);

    gate.open();
    drop(tx);
    let stats = driver.await.unwrap();

    assert_eq!(
        *gate.sent.lock().unwrap(),
        vec!["Created the deployment ns/a", "Updated the deployment ns/a with: replicas: 2 → 3"]
    );
    assert_eq!(gate.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(stats.invocations, 2);
    assert_eq!(store.record(&Identity::new("ns", "a")).map(|r| r.snapshot.generation), Some(2));
}

#[tokio::test]
async fn closing_inbound_waits_for_in_flight_work() {
    let (store, gate, rec) = gated();
    store.put_resource(resource("a", 1, 0));
    let (tx, rx) = mpsc::channel(8);
    let driver = tokio::spawn(run_driver(rec, rx, fast()));
    tx.send(applied("a")).await.unwrap();
    gate.wait_entered(1).await;
    drop(tx);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!driver.is_finished());
    assert!(store.record(&Identity::new("ns", "a")).is_none());

    gate.open();
    let stats = driver.await.unwrap();
    assert_eq!(*gate.sent.lock().unwrap(), vec!["Created the deployment ns/a"]);
    assert_eq!(stats.invocations, 1);
    assert!(store.record(&Identity::new("ns", "a")).is_some());
}
