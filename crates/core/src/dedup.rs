//! Process-local dedup cache: last generation notified per (identity, kind).
//!
//! Lost on restart. The durable record stays the authoritative guard; this only
//! suppresses repeated sends within one process lifetime.

use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::{Identity, TransitionKind};

#[derive(Debug, Default)]
pub struct DedupCache {
    inner: Mutex<FxHashMap<(Identity, TransitionKind), i64>>,
}

impl DedupCache {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<(Identity, TransitionKind), i64>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// False iff `kind` was already marked for `identity` at exactly `generation`.
    pub fn should_notify(&self, identity: &Identity, kind: TransitionKind, generation: i64) -> bool {
        self.lock().get(&(identity.clone(), kind)) != Some(&generation)
    }

    pub fn mark_notified(&self, identity: &Identity, kind: TransitionKind, generation: i64) {
        self.lock().insert((identity.clone(), kind), generation);
    }

    /// Drop every tracked kind for `identity`.
    pub fn clear(&self, identity: &Identity) {
        let mut map = self.lock();
        for kind in TransitionKind::TRACKED {
            map.remove(&(identity.clone(), kind));
        }
    }

    pub fn get(&self, identity: &Identity, kind: TransitionKind) -> Option<i64> {
        self.lock().get(&(identity.clone(), kind)).copied()
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }
}
