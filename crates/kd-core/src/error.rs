use uuid::Uuid;

use crate::types::EnvironmentStatus;

/// Errors surfaced by the Environment Store and the Lifecycle API.
///
/// `Validation` and `Conflict` are returned synchronously and never reach a
/// provisioning workflow. `Provisioning` is only returned to callers of
/// teardown; a failed *creation* shows up as `EnvironmentStatus::Error` on
/// the record instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("environment not found: {0}")]
    NotFound(Uuid),

    #[error("invalid transition: cannot move environment from {from} to {to}")]
    InvalidTransition {
        from: EnvironmentStatus,
        to: EnvironmentStatus,
    },

    #[error("provisioning: {0}")]
    Provisioning(String),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
