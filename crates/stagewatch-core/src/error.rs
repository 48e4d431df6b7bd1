use crate::reconciler::ScopeKey;
use crate::status::PromotionPhase;

/// Failure reported by the transport collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("stream failed: {0}")]
    Stream(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("snapshot fetch for {scope} failed: {source}")]
    Snapshot {
        scope: ScopeKey,
        #[source]
        source: ServiceError,
    },
    #[error("watch subscription for {scope} failed: {source}")]
    Subscribe {
        scope: ScopeKey,
        #[source]
        source: ServiceError,
    },
    #[error("reconciler for {0} already started")]
    AlreadyStarted(ScopeKey),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("promotion {name} cannot be retried while {phase}")]
    NotRetryable { name: String, phase: PromotionPhase },
    #[error("a retry is already in flight")]
    InFlight,
    #[error("promotion {name} has no {field}")]
    Incomplete { name: String, field: &'static str },
    #[error(transparent)]
    Service(#[from] ServiceError),
}
