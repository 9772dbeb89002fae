//! Herald store: identity-keyed coalescing queue and an in-memory versioned store
//! for notification records and watched resources.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use herald_core::{Identity, NotificationRecord, RecordStore, ResourceSource, StoreError, WatchedResource};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Coalescing queue keyed by `K` with FIFO order and fixed capacity.
///
/// Pushing a key that is already queued replaces its value in place; when full the
/// oldest key is evicted and counted as dropped.
pub struct Coalescer<K, V> {
    map: FxHashMap<K, V>,
    order: VecDeque<K>,
    cap: usize,
    dropped: u64,
}

impl<K: Eq + Hash + Clone, V> Coalescer<K, V> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, key: K, value: V) {
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, value);
    }

    /// Drain everything queued, oldest first.
    pub fn drain_ready(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(v) = self.map.remove(&key) {
                out.push((key, v));
            }
        }
        out
    }
}

/// In-memory store with per-record version tokens.
///
/// Serves as both [`RecordStore`] and [`ResourceSource`]. Used by `heraldctl replay`
/// and by tests; `inject_conflicts` simulates a concurrent writer.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<FxHashMap<Identity, NotificationRecord>>,
    resources: Mutex<FxHashMap<Identity, WatchedResource>>,
    next_version: AtomicU64,
    pending_conflicts: AtomicUsize,
    writes: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn bump(&self) -> String { (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    pub fn put_resource(&self, resource: WatchedResource) {
        lock(&self.resources).insert(resource.identity.clone(), resource);
    }

    pub fn remove_resource(&self, identity: &Identity) -> Option<WatchedResource> {
        lock(&self.resources).remove(identity)
    }

    pub fn record(&self, identity: &Identity) -> Option<NotificationRecord> {
        lock(&self.records).get(identity).cloned()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        let mut out: Vec<_> = lock(&self.records).values().cloned().collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    /// Successful creates plus replaces.
    pub fn writes(&self) -> u64 { self.writes.load(Ordering::SeqCst) }

    /// Make the next `n` replaces fail with a conflict, bumping the stored version
    /// each time as a concurrent writer would.
    pub fn inject_conflicts(&self, n: usize) { self.pending_conflicts.store(n, Ordering::SeqCst); }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl ResourceSource for MemoryStore {
    async fn get(&self, identity: &Identity) -> Result<Option<WatchedResource>, StoreError> {
        Ok(lock(&self.resources).get(identity).cloned())
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, identity: &Identity) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(self.record(identity))
    }

    async fn create(&self, record: &NotificationRecord) -> Result<NotificationRecord, StoreError> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.identity) {
            return Err(StoreError::AlreadyExists(record.identity.to_string()));
        }
        let mut stored = record.clone();
        stored.version = Some(self.bump());
        records.insert(stored.identity.clone(), stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(identity = %stored.identity, version = ?stored.version, "record created");
        Ok(stored)
    }

    async fn replace(&self, record: &NotificationRecord) -> Result<NotificationRecord, StoreError> {
        let mut records = lock(&self.records);
        let Some(current) = records.get_mut(&record.identity) else {
            return Err(StoreError::NotFound(record.identity.to_string()));
        };
        if self.take_conflict() {
            current.version = Some(self.bump());
        }
        if current.version != record.version {
            return Err(StoreError::Conflict(format!(
                "{}: version {:?} is stale (stored {:?})",
                record.identity, record.version, current.version
            )));
        }
        let mut stored = record.clone();
        stored.version = Some(self.bump());
        *current = stored.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str, generation: i64) -> WatchedResource {
        WatchedResource {
            identity: Identity::new("ns", name),
            uid: None,
            generation,
            desired_replicas: 1,
            ready_replicas: 0,
            observed_generation: 0,
            deleting: false,
            spec: serde_json::json!({ "replicas": 1 }),
        }
    }

    #[test]
    fn coalescer_keeps_fifo_and_latest_value() {
        let mut c = Coalescer::with_capacity(8);
        c.push("a", 1);
        c.push("b", 1);
        c.push("a", 2);
        assert_eq!(c.len(), 2);
        assert_eq!(c.drain_ready(), vec![("a", 2), ("b", 1)]);
        assert!(c.is_empty());
    }

    #[test]
    fn coalescer_evicts_oldest_when_full() {
        let mut c = Coalescer::with_capacity(2);
        c.push(1, ());
        c.push(2, ());
        c.push(3, ());
        assert_eq!(c.dropped(), 1);
        let keys: Vec<_> = c.drain_ready().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![2, 3]);
    }

    #[tokio::test]
    async fn create_then_stale_replace_conflicts() {
        let s = MemoryStore::new();
        let rec = NotificationRecord::new(&resource("app", 1), "m");
        let v1 = s.create(&rec).await.unwrap();
        assert!(matches!(s.create(&rec).await, Err(StoreError::AlreadyExists(_))));

        let mut upd = v1.clone();
        upd.message = "m2".into();
        let v2 = s.replace(&upd).await.unwrap();
        assert_ne!(v1.version, v2.version);

        // v1 is now stale
        let err = s.replace(&v1).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(s.writes(), 2);
    }

    #[tokio::test]
    async fn injected_conflict_requires_refetch() {
        let s = MemoryStore::new();
        let v1 = s.create(&NotificationRecord::new(&resource("app", 1), "m")).await.unwrap();
        s.inject_conflicts(1);
        assert!(s.replace(&v1).await.unwrap_err().is_conflict());
        let fresh = RecordStore::get(&s, &v1.identity).await.unwrap().unwrap();
        assert!(s.replace(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn resources_round_trip() {
        let s = MemoryStore::new();
        let id = Identity::new("ns", "app");
        s.put_resource(resource("app", 3));
        assert_eq!(ResourceSource::get(&s, &id).await.unwrap().map(|r| r.generation), Some(3));
        s.remove_resource(&id);
        assert!(ResourceSource::get(&s, &id).await.unwrap().is_none());
    }
}
