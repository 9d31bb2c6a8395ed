//! HTTP error mapping for the gateway API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use dispatch_core::error::DispatchError;

/// Error response payload.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    /// Stable error code identifier.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

/// Gateway-level error: a core error plus its HTTP rendering.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ApiError(#[from] pub DispatchError);

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            DispatchError::AuthFailed(_) => (StatusCode::UNAUTHORIZED, "AUTH_FAILED"),
            DispatchError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            DispatchError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            DispatchError::PreconditionFailed(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "PRECONDITION_FAILED")
            }
            DispatchError::TransientStore(_) | DispatchError::Timeout(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            DispatchError::RoutingUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ROUTING_UNAVAILABLE")
            }
            DispatchError::PermanentStore(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
            }
            DispatchError::InvalidCoordinates { .. } => {
                (StatusCode::BAD_REQUEST, "INVALID_COORDINATES")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: code.to_string(),
                message: self.0.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let err = ApiError(DispatchError::Conflict("offer already taken".into()));
        let (status, code) = err.status_and_code();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "CONFLICT");
    }

    #[test]
    fn transient_store_maps_to_503() {
        let err = ApiError(DispatchError::TransientStore("io".into()));
        let (status, _) = err.status_and_code();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
