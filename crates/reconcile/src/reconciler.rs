//! Record reconciler: classify, gate on the dedup cache, notify, persist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use herald_core::{
    classify, DedupCache, Identity, Notification, NotificationRecord, Notifier, RecordStore, ResourceSource, StoreError,
    Transition, TransitionKind, WatchedResource,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::retry::{update_on_conflict, RetryPolicy};
use crate::ReconcileError;

/// How a successful invocation wants to be treated by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Come back later without counting a failure (deletion still in progress).
    Requeue(Duration),
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub retry: RetryPolicy,
    pub deleting_requeue: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self { Self { retry: RetryPolicy::default(), deleting_requeue: Duration::from_secs(5) } }
}

pub struct Reconciler {
    resources: Arc<dyn ResourceSource>,
    records: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    cache: Arc<DedupCache>,
    opts: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        resources: Arc<dyn ResourceSource>,
        records: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
        cache: Arc<DedupCache>,
        opts: ReconcilerOptions,
    ) -> Self {
        Self { resources, records, notifier, cache, opts }
    }

    pub fn cache(&self) -> &Arc<DedupCache> { &self.cache }

    /// Run one reconciliation pass for `identity`.
    pub async fn reconcile(&self, identity: &Identity) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.reconcile_inner(identity).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_errors_total", 1u64, "kind" => e.kind());
        }
        res
    }

    async fn reconcile_inner(&self, identity: &Identity) -> Result<Outcome, ReconcileError> {
        debug!(identity = %identity, "reconciling");
        let current = self
            .resources
            .get(identity)
            .await
            .map_err(|source| ReconcileError::Fetch { identity: identity.clone(), what: "resource", source })?;
        let Some(current) = current else {
            return self.handle_deleted(identity).await;
        };
        if current.deleting {
            debug!(identity = %identity, "deletion in progress; waiting for removal");
            return Ok(Outcome::Requeue(self.opts.deleting_requeue));
        }

        let mut record = self
            .records
            .get(identity)
            .await
            .map_err(|source| ReconcileError::Fetch { identity: identity.clone(), what: "record", source })?;
        let transitions = classify(identity, record.as_ref(), Some(&current))
            .map_err(|source| ReconcileError::Classification { identity: identity.clone(), source })?;

        for transition in transitions {
            match transition {
                Transition::Created { message } => {
                    // a record seen alongside Created was left by an earlier object with this identity
                    let stale = record.take();
                    if stale.is_some() {
                        info!(identity = %identity, uid = ?current.uid, "record belongs to a previous object; starting over");
                        self.cache.clear(identity);
                    }
                    // at-most-once when the sink fails: the record is written anyway, so a retry finds nothing to send
                    let sent = self.notify_once(identity, TransitionKind::Created, current.generation, &message).await;
                    let written = match stale {
                        None => self
                            .records
                            .create(&NotificationRecord::new(&current, message))
                            .await
                            .map_err(|source| ReconcileError::Persist { identity: identity.clone(), source }),
                        Some(base) => {
                            update_on_conflict(self.records.as_ref(), base, &self.opts.retry, |r| {
                                apply_recreate(r, &current, &message)
                            })
                            .await
                        }
                    };
                    match written {
                        Ok(stored) => record = Some(stored),
                        Err(err) => return Err(prefer_transport(sent, err)),
                    }
                    sent?;
                }
                Transition::Updated { message, diff } => {
                    debug!(identity = %identity, changes = diff.changes.len(), "spec changed");
                    // at-most-once when the sink fails, as for Created
                    let sent = self.notify_once(identity, TransitionKind::Updated, current.generation, &message).await;
                    let base = existing(identity, record.take())?;
                    match update_on_conflict(self.records.as_ref(), base, &self.opts.retry, |r| {
                        apply_update(r, &current, &message)
                    })
                    .await
                    {
                        Ok(stored) => record = Some(stored),
                        Err(err) => return Err(prefer_transport(sent, err)),
                    }
                    sent?;
                }
                Transition::Ready { message } => {
                    // readiness is only confirmed once the notification went out
                    self.notify_once(identity, TransitionKind::Ready, current.generation, &message).await?;
                    let base = existing(identity, record.take())?;
                    let stored = update_on_conflict(self.records.as_ref(), base, &self.opts.retry, |r| {
                        apply_ready(r, &current, &message)
                    })
                    .await?;
                    record = Some(stored);
                }
                Transition::Deleted { .. } | Transition::NoOp => {
                    debug!(identity = %identity, generation = current.generation, "nothing to notify");
                }
            }
        }
        Ok(Outcome::Done)
    }

    async fn handle_deleted(&self, identity: &Identity) -> Result<Outcome, ReconcileError> {
        let transitions = classify(identity, None, None)
            .map_err(|source| ReconcileError::Classification { identity: identity.clone(), source })?;
        let message = transitions.iter().find_map(|t| t.message()).unwrap_or_default().to_string();
        let sent = self.notifier.send(&Notification::new(identity, message)).await;
        self.cache.clear(identity);
        // the record is kept; removing it alongside the resource is an open product decision
        match sent {
            Ok(()) => {
                info!(identity = %identity, kind = "deleted", "notified");
                Ok(Outcome::Done)
            }
            Err(source) => Err(ReconcileError::Transport { identity: identity.clone(), kind: TransitionKind::Deleted, source }),
        }
    }

    /// Send unless the cache says this exact generation already went out for `kind`.
    async fn notify_once(
        &self,
        identity: &Identity,
        kind: TransitionKind,
        generation: i64,
        message: &str,
    ) -> Result<(), ReconcileError> {
        if !self.cache.should_notify(identity, kind, generation) {
            counter!("notify_suppressed_total", 1u64);
            debug!(identity = %identity, kind = kind.as_str(), generation, "already notified; suppressed");
            return Ok(());
        }
        self.notifier
            .send(&Notification::new(identity, message))
            .await
            .map_err(|source| ReconcileError::Transport { identity: identity.clone(), kind, source })?;
        self.cache.mark_notified(identity, kind, generation);
        info!(identity = %identity, kind = kind.as_str(), generation, "notified");
        Ok(())
    }
}

fn existing(identity: &Identity, record: Option<NotificationRecord>) -> Result<NotificationRecord, ReconcileError> {
    record.ok_or_else(|| ReconcileError::Persist {
        identity: identity.clone(),
        source: StoreError::NotFound(identity.to_string()),
    })
}

/// When both the send and the write failed, report the send.
fn prefer_transport(sent: Result<(), ReconcileError>, persist: ReconcileError) -> ReconcileError {
    match sent {
        Ok(()) => persist,
        Err(transport) => {
            warn!(error = %persist, "record write failed after failed send");
            transport
        }
    }
}

/// Take over a record left by an earlier object with the same identity.
fn apply_recreate(r: &mut NotificationRecord, current: &WatchedResource, message: &str) -> bool {
    if r.snapshot.same_object(current) {
        return false;
    }
    r.message = message.to_string();
    r.snapshot = current.snapshot();
    r.ready_generation = None;
    true
}

/// Record the new spec snapshot; never move the snapshot generation of one object backwards.
fn apply_update(r: &mut NotificationRecord, current: &WatchedResource, message: &str) -> bool {
    let same = r.snapshot.same_object(current);
    if same && r.snapshot.generation > current.generation {
        return false;
    }
    if same && r.snapshot.generation == current.generation && r.message == message {
        return false;
    }
    r.message = message.to_string();
    r.snapshot = current.snapshot();
    true
}

fn apply_ready(r: &mut NotificationRecord, current: &WatchedResource, message: &str) -> bool {
    let same = r.snapshot.same_object(current);
    if same && (r.snapshot.generation > current.generation || r.ready_generation == Some(current.generation)) {
        return false;
    }
    r.message = message.to_string();
    r.snapshot = current.snapshot();
    r.ready_generation = Some(current.generation);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(generation: i64) -> WatchedResource {
        WatchedResource {
            identity: Identity::new("ns", "app"),
            uid: None,
            generation,
            desired_replicas: 2,
            ready_replicas: 2,
            observed_generation: generation,
            deleting: false,
            spec: json!({ "replicas": generation }),
        }
    }

    #[test]
    fn update_never_regresses_snapshot() {
        let mut r = NotificationRecord::new(&res(3), "newer");
        assert!(!apply_update(&mut r, &res(2), "older"));
        assert_eq!(r.snapshot.generation, 3);
        assert!(apply_update(&mut r, &res(4), "next"));
        assert_eq!((r.snapshot.generation, r.message.as_str()), (4, "next"));
        assert!(!apply_update(&mut r, &res(4), "next"));
    }

    #[test]
    fn ready_sets_generation_once() {
        let mut r = NotificationRecord::new(&res(2), "m");
        assert!(apply_ready(&mut r, &res(2), "ready"));
        assert_eq!(r.ready_generation, Some(2));
        assert!(!apply_ready(&mut r, &res(2), "ready"));
        assert!(!apply_ready(&mut r, &res(1), "ready"));
    }

    #[test]
    fn recreate_replaces_record_of_previous_object() {
        let mut old = res(3);
        old.uid = Some("old".into());
        let mut r = NotificationRecord::new(&old, "old");
        r.ready_generation = Some(3);

        let mut fresh = res(1);
        fresh.uid = Some("new".into());
        assert!(apply_recreate(&mut r, &fresh, "Created"));
        assert_eq!(r.snapshot.generation, 1);
        assert_eq!(r.snapshot.uid.as_deref(), Some("new"));
        assert_eq!(r.ready_generation, None);
        assert!(!apply_recreate(&mut r, &fresh, "Created"));
    }
}
