//! Desktop session error types.

use thiserror::Error;

/// Errors that cross the lifecycle manager boundary.
///
/// Everything else (liveness ambiguity, cleanup failures, audit writes) is
/// resolved inside the desktop layer and never surfaces as an error.
#[derive(Debug, Error)]
pub enum DesktopError {
    /// The caller's identity is not a positive integer, or it maps outside
    /// the port range. Raised before any side effect.
    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    /// The runtime refused to start the desktop container.
    #[error("failed to provision desktop: {0}")]
    Provision(String),
}

pub type DesktopResult<T> = Result<T, DesktopError>;
