use folio_contracts::StoreError;
use thiserror::Error;

use crate::orchestrator::PendingArtifact;

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Rejected before anything was sent or written.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The provider call failed, timed out or returned no image.
    #[error("image provider failed: {0}")]
    ExternalApi(String),

    /// The image was received but could not be stored. `pending` keeps the
    /// bytes so persistence can be retried without another provider call.
    #[error("generated image could not be saved: {reason}")]
    Persistence {
        reason: String,
        pending: Box<PendingArtifact>,
    },
}

impl GenerationError {
    /// Store failures hit while preparing a request; nothing was sent yet.
    pub(crate) fn from_store(err: StoreError) -> Self {
        GenerationError::Validation(err.to_string())
    }

    pub fn pending(&self) -> Option<&PendingArtifact> {
        match self {
            GenerationError::Persistence { pending, .. } => Some(pending.as_ref()),
            _ => None,
        }
    }

    pub fn into_pending(self) -> Option<PendingArtifact> {
        match self {
            GenerationError::Persistence { pending, .. } => Some(*pending),
            _ => None,
        }
    }
}
