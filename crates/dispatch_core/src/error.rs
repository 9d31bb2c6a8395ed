//! Error types shared across the dispatch core.

use thiserror::Error;

/// Errors produced by the dispatch subsystems.
///
/// `TransientStore` is retryable; callers that promise retry semantics
/// (offer accept, location sync) handle it explicitly instead of surfacing
/// it to clients.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("transient store failure: {0}")]
    TransientStore(String),

    #[error("permanent store failure: {0}")]
    PermanentStore(String),

    #[error("routing unavailable: {0}")]
    RoutingUnavailable(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid coordinates: lat={lat} lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },
}

impl DispatchError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::TransientStore(_)
                | DispatchError::RoutingUnavailable(_)
                | DispatchError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DispatchError::TransientStore("io".into()).is_transient());
        assert!(DispatchError::Timeout("routing".into()).is_transient());
        assert!(!DispatchError::Conflict("taken".into()).is_transient());
        assert!(!DispatchError::AuthFailed("bad token".into()).is_transient());
    }
}
