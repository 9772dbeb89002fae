use herald_core::{ClassifyError, Identity, NotifyError, StoreError, TransitionKind};
use thiserror::Error;

/// Why one reconciliation invocation failed. Every variant asks the driver to retry
/// the whole invocation later; only write conflicts are retried locally first.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("fetching {what} for {identity}: {source}")]
    Fetch {
        identity: Identity,
        what: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("persisting record for {identity}: {source}")]
    Persist {
        identity: Identity,
        #[source]
        source: StoreError,
    },
    #[error("record for {identity} still conflicting after {attempts} attempts")]
    Conflict { identity: Identity, attempts: u32 },
    #[error("sending {kind:?} notification for {identity}: {source}")]
    Transport {
        identity: Identity,
        kind: TransitionKind,
        #[source]
        source: NotifyError,
    },
    #[error("classifying {identity}: {source}")]
    Classification {
        identity: Identity,
        #[source]
        source: ClassifyError,
    },
}

impl ReconcileError {
    pub fn identity(&self) -> &Identity {
        match self {
            ReconcileError::Fetch { identity, .. }
            | ReconcileError::Persist { identity, .. }
            | ReconcileError::Conflict { identity, .. }
            | ReconcileError::Transport { identity, .. }
            | ReconcileError::Classification { identity, .. } => identity,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Fetch { .. } => "fetch",
            ReconcileError::Persist { .. } => "persist",
            ReconcileError::Conflict { .. } => "conflict",
            ReconcileError::Transport { .. } => "transport",
            ReconcileError::Classification { .. } => "classification",
        }
    }
}
