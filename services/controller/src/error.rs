//! Controller error taxonomy.

use fleetplane_api::{MutationError, ObjectKey};
use fleetplane_networking::PortError;
use fleetplane_reconcile::ReconcileFailure;
use thiserror::Error;

use crate::autoscaler::WebhookError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;

/// How the work queue treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Record on the object and stop retrying.
    Terminal,
    /// Stop the process.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("invalid {kind} {key}: {reason}")]
    Invalid {
        kind: &'static str,
        key: ObjectKey,
        reason: String,
    },

    #[error("cannot digest template: {0}")]
    Digest(#[from] serde_json::Error),

    #[error("leadership lost")]
    LeadershipLost,
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Store(StoreError::Invalid { .. }) => ErrorClass::Terminal,
            ControllerError::Store(_) => ErrorClass::Transient,
            ControllerError::Runtime(_) => ErrorClass::Transient,
            ControllerError::Webhook(_) => ErrorClass::Transient,
            ControllerError::Ports(_) => ErrorClass::Terminal,
            ControllerError::Mutation(_) => ErrorClass::Terminal,
            ControllerError::Invalid { .. } => ErrorClass::Terminal,
            ControllerError::Digest(_) => ErrorClass::Fatal,
            ControllerError::LeadershipLost => ErrorClass::Fatal,
        }
    }

    /// Stable machine-readable reason, written to status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Store(StoreError::Conflict { .. }) => "Conflict",
            ControllerError::Store(StoreError::NotFound { .. }) => "NotFound",
            ControllerError::Store(StoreError::AlreadyExists { .. }) => "AlreadyExists",
            ControllerError::Store(StoreError::Invalid { .. }) => "InvalidObject",
            ControllerError::Runtime(_) => "PodCreateFailed",
            ControllerError::Ports(PortError::Exhausted { .. }) => "PortRangeExhausted",
            ControllerError::Ports(PortError::Collision { .. }) => "PortCollision",
            ControllerError::Ports(_) => "PortInvalid",
            ControllerError::Webhook(_) => "WebhookFailed",
            ControllerError::Mutation(_) => "MutationRejected",
            ControllerError::Invalid { .. } => "InvalidTemplate",
            ControllerError::Digest(_) => "CorruptState",
            ControllerError::LeadershipLost => "LeadershipLost",
        }
    }

    pub fn invalid(kind: &'static str, key: ObjectKey, reason: impl Into<String>) -> Self {
        ControllerError::Invalid {
            kind,
            key,
            reason: reason.into(),
        }
    }
}

impl ReconcileFailure for ControllerError {
    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
