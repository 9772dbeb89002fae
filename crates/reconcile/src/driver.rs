//! Event loop driver: coalesce signals per identity, run reconciliations on a bounded
//! number of tasks, and reschedule failures with per-identity backoff.

use std::sync::Arc;
use std::time::Duration;

use herald_core::{Identity, Signal, SignalKind};
use herald_store::Coalescer;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{Outcome, ReconcileError, Reconciler};

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub queue_cap: usize,
    pub workers: usize,
    /// Flush interval for the coalescing queue.
    pub tick: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            queue_cap: 2048,
            workers: 4,
            tick: Duration::from_millis(50),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
        }
    }
}

impl DriverOptions {
    /// Backoff before the `failures`-th consecutive retry of one identity.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        self.retry_base.saturating_mul(1u32 << shift).min(self.retry_max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub invocations: u64,
    pub failures: u64,
    pub requeues: u64,
    /// Signals evicted from a full queue.
    pub dropped: u64,
}

/// Consume signals from `rx` until it closes, then drain queued and in-flight work.
/// Retries still waiting on their backoff at that point are dropped.
pub async fn run(reconciler: Arc<Reconciler>, mut rx: mpsc::Receiver<Signal>, opts: DriverOptions) -> DriverStats {
    let workers = opts.workers.max(1);
    let mut queue: Coalescer<Identity, SignalKind> = Coalescer::with_capacity(opts.queue_cap);
    let mut in_flight: FxHashSet<Identity> = FxHashSet::default();
    let mut failures: FxHashMap<Identity, u32> = FxHashMap::default();
    let (done_tx, mut done_rx) = mpsc::channel::<(Identity, Result<Outcome, ReconcileError>)>(workers);
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<Identity>();
    let mut pending_retries = 0usize;
    let mut stats = DriverStats::default();
    let mut ticker = tokio::time::interval(opts.tick);
    let mut inbound_open = true;

    info!(workers, queue_cap = opts.queue_cap, "driver started");
    loop {
        tokio::select! {
            maybe = rx.recv(), if inbound_open => match maybe {
                Some(sig) => {
                    debug!(identity = %sig.identity, kind = ?sig.kind, "signal");
                    queue.push(sig.identity, sig.kind);
                }
                None => {
                    debug!("signal channel closed; draining");
                    inbound_open = false;
                }
            },
            Some(id) = retry_rx.recv() => {
                pending_retries = pending_retries.saturating_sub(1);
                queue.push(id, SignalKind::Applied);
            }
            Some((id, res)) = done_rx.recv() => {
                in_flight.remove(&id);
                let delay = match res {
                    Ok(Outcome::Done) => {
                        failures.remove(&id);
                        None
                    }
                    Ok(Outcome::Requeue(d)) => {
                        stats.requeues += 1;
                        Some(d)
                    }
                    Err(e) => {
                        stats.failures += 1;
                        let n = failures.entry(id.clone()).or_insert(0);
                        *n += 1;
                        let d = opts.backoff(*n);
                        warn!(identity = %id, error = %e, kind = e.kind(), attempt = *n, retry_in = ?d, "reconcile failed");
                        Some(d)
                    }
                };
                if let Some(d) = delay {
                    pending_retries += 1;
                    let tx = retry_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(d).await;
                        let _ = tx.send(id);
                    });
                }
            }
            _ = ticker.tick() => {
                let before = queue.dropped();
                let mut held = Vec::new();
                for (id, kind) in queue.drain_ready() {
                    if in_flight.contains(&id) || in_flight.len() >= workers {
                        held.push((id, kind));
                        continue;
                    }
                    in_flight.insert(id.clone());
                    stats.invocations += 1;
                    let r = Arc::clone(&reconciler);
                    let tx = done_tx.clone();
                    tokio::spawn(async move {
                        let res = r.reconcile(&id).await;
                        let _ = tx.send((id, res)).await;
                    });
                }
                for (id, kind) in held {
                    queue.push(id, kind);
                }
                let evicted = queue.dropped() - before;
                if evicted > 0 {
                    counter!("driver_coalesced_dropped_total", evicted);
                }
            }
        }
        if !inbound_open && queue.is_empty() && in_flight.is_empty() {
            break;
        }
    }
    if pending_retries > 0 {
        warn!(pending = pending_retries, "driver stopping with retries still scheduled");
    }
    stats.dropped = queue.dropped();
    info!(invocations = stats.invocations, failures = stats.failures, "driver stopped");
    stats
}
