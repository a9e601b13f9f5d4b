use crate::cluster::ClientError;

/// Errors surfaced by a reconcile pass.
///
/// Every variant is returned to the work queue which requeues the key with backoff. Configuration
/// errors fail identically until the object is edited.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("spec.replicas of {0} is nil")]
    NilReplicas(String),

    #[error("invalid pod index range: {0}")]
    InvalidPodIndexRange(String),

    #[error("invalid update strategy type {0}")]
    InvalidUpdateStrategy(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("invalid int or percentage value {0:?}")]
    InvalidIntOrPercent(String),

    #[error("pod {0} can not be updated in place")]
    NotInPlaceUpdatable(String),

    #[error("revision {0}: {1}")]
    Revision(String, String),

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("hook argument {0} was not resolved")]
    UnresolvedHookArgument(String),

    #[error("reconcile panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Client(e) if e.is_not_found())
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Client(e) if e.is_already_exists())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
