//! Read-modify-write of a notification record under optimistic concurrency.

use std::time::Duration;

use herald_core::{NotificationRecord, RecordStore, StoreError};
use metrics::counter;
use tracing::debug;

use crate::ReconcileError;

/// Bounded exponential backoff for write conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total write attempts, including the first.
    pub steps: u32,
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { steps: 4, initial: Duration::from_millis(10), factor: 5, max: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the `attempt`-th failed write (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut d = self.initial;
        for _ in 1..attempt {
            d = d.saturating_mul(self.factor.max(1));
            if d >= self.max { return self.max; }
        }
        d.min(self.max)
    }
}

/// Apply `change` to `base` and replace it in `store`. On a stale-version conflict the
/// record is re-fetched and `change` is applied again to the fresh copy; other errors
/// return immediately. `change` returns false when the record already reflects the
/// intended state, in which case nothing is written.
pub async fn update_on_conflict<F>(
    store: &dyn RecordStore,
    base: NotificationRecord,
    policy: &RetryPolicy,
    mut change: F,
) -> Result<NotificationRecord, ReconcileError>
where
    F: FnMut(&mut NotificationRecord) -> bool,
{
    let identity = base.identity.clone();
    let mut current = base;
    let steps = policy.steps.max(1);
    for attempt in 1..=steps {
        let mut next = current.clone();
        if !change(&mut next) {
            return Ok(current);
        }
        match store.replace(&next).await {
            Ok(stored) => return Ok(stored),
            Err(e) if e.is_conflict() => {
                counter!("record_conflicts_total", 1u64);
                debug!(identity = %identity, attempt, error = %e, "record write conflicted");
                if attempt == steps {
                    break;
                }
                tokio::time::sleep(policy.delay(attempt)).await;
                current = match store.get(&identity).await {
                    Ok(Some(fresh)) => fresh,
                    Ok(None) => {
                        return Err(ReconcileError::Persist {
                            identity: identity.clone(),
                            source: StoreError::NotFound(identity.to_string()),
                        })
                    }
                    Err(source) => return Err(ReconcileError::Fetch { identity, what: "record", source }),
                };
            }
            Err(source) => return Err(ReconcileError::Persist { identity, source }),
        }
    }
    Err(ReconcileError::Conflict { identity, attempts: steps })
}
