//! Error kinds surfaced by the collaborator seams.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("sink rejected notification with status {status}")]
    Rejected { status: u16 },
    #[error("encoding payload: {0}")]
    Encode(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("malformed spec snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("spec too complex to diff (>{0} nodes)")]
    TooComplex(usize),
}
