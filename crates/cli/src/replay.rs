//! Offline replay of recorded deployment events through the reconciler.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use herald_core::{DedupCache, Identity, Notification, Notifier, NotifyError};
use herald_reconcile::{Outcome, Reconciler, ReconcilerOptions};
use herald_store::MemoryStore;
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One line of a replay file. A null `deployment` means the object is gone.
#[derive(Debug, Deserialize)]
pub struct ReplayEvent {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub deployment: Option<Deployment>,
}

impl ReplayEvent {
    pub fn identity(&self) -> Identity { Identity::new(&self.namespace, &self.name) }
}

/// Parse JSON lines; blank lines and `#` comments are skipped.
pub fn parse_events(input: &str) -> Result<Vec<ReplayEvent>> {
    let mut out = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let ev: ReplayEvent = serde_json::from_str(line).with_context(|| format!("line {}: invalid replay event", idx + 1))?;
        out.push(ev);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Step {
    pub identity: String,
    pub outcome: String,
    pub sent: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Forwards to the real sink and remembers what went out during the current step.
struct Capture {
    inner: Arc<dyn Notifier>,
    sent: Mutex<Vec<String>>,
}

impl Capture {
    fn take(&self) -> Vec<String> {
        let mut g = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *g)
    }
}

#[async_trait::async_trait]
impl Notifier for Capture {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.inner.send(notification).await?;
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).push(notification.message.clone());
        Ok(())
    }
}

/// Apply each event to an in-memory cluster and run one reconciliation after it.
pub async fn replay(events: Vec<ReplayEvent>, sink: Arc<dyn Notifier>) -> Result<Vec<Step>> {
    let store = Arc::new(MemoryStore::new());
    let capture = Arc::new(Capture { inner: sink, sent: Mutex::new(Vec::new()) });
    let reconciler = Reconciler::new(
        store.clone(),
        store.clone(),
        capture.clone(),
        Arc::new(DedupCache::new()),
        ReconcilerOptions::default(),
    );
    let mut steps = Vec::with_capacity(events.len());
    for ev in events {
        let identity = ev.identity();
        match &ev.deployment {
            Some(d) => {
                let mut resource = herald_kubehub::watched_from_deployment(d)
                    .with_context(|| format!("{}: unusable deployment", identity))?;
                resource.identity = identity.clone();
                store.put_resource(resource);
            }
            None => {
                store.remove_resource(&identity);
            }
        }
        debug!(identity = %identity, present = ev.deployment.is_some(), "replaying event");
        let res = reconciler.reconcile(&identity).await;
        let (outcome, error) = match res {
            Ok(Outcome::Done) => ("done".to_string(), None),
            Ok(Outcome::Requeue(d)) => (format!("requeue {}s", d.as_secs()), None),
            Err(e) => (format!("error ({})", e.kind()), Some(e.to_string())),
        };
        steps.push(Step { identity: identity.to_string(), outcome, sent: capture.take(), error });
    }
    Ok(steps)
}
