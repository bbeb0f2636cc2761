//! Error taxonomy and requeue policy.
//!
//! Classification is by variant, never by message text. The store layer
//! produces `StoreError`; the pipeline wraps retryable outcomes into
//! `Error::Requeue` with a component tag, and `disposition()` is the one
//! exhaustive switch deciding terminal vs. retry-after.

use std::time::Duration;

pub use promstack_model::ValidationError;

/// Outcome of a single store verb against one object.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Expected at the snapshot layer; an error only when a write needs
    /// the object to exist.
    #[error("{kind}/{name} not found")]
    NotFound { kind: String, name: String },
    /// Optimistic-concurrency collision: someone wrote between our read
    /// and our write.
    #[error("version conflict writing {kind}/{name}")]
    Conflict { kind: String, name: String },
    /// Create raced another writer.
    #[error("{kind}/{name} already exists")]
    AlreadyExists { kind: String, name: String },
    /// The store could not serve the request; the whole pass is suspect.
    #[error("object store unavailable: {message}")]
    Unavailable { message: String },
}

/// A reconciliation pass error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed Specification; the user must fix the input.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Convergence is still in progress; re-run the pass after a short
    /// delay. Never indicates corruption or bad input.
    #[error("component {component} requeued: {reason}")]
    Requeue { component: &'static str, reason: String },
}

/// What the control loop should do with a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Surface to the caller; its own backoff policy applies.
    Terminal,
    /// Re-invoke the whole pass after the delay.
    RetryAfter(Duration),
}

/// Bounded delay before a requeued pass re-runs.
pub fn requeue_delay() -> Duration {
    let secs = std::env::var("PROMSTACK_REQUEUE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(1);
    Duration::from_secs(secs)
}

impl Error {
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::Requeue { .. } => Disposition::RetryAfter(requeue_delay()),
            Error::Store(StoreError::Conflict { .. })
            | Error::Store(StoreError::AlreadyExists { .. }) => {
                Disposition::RetryAfter(requeue_delay())
            }
            Error::Store(StoreError::NotFound { .. })
            | Error::Store(StoreError::Unavailable { .. }) => Disposition::Terminal,
            Error::Validation(_) => Disposition::Terminal,
        }
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self.disposition(), Disposition::RetryAfter(_))
    }
}
