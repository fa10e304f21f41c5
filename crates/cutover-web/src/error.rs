//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use cutover_engine::{ProvisioningError, TriggerRejection};
use serde_json::json;
use thiserror::Error;

/// Errors that can occur while serving a request.
#[derive(Debug, Error)]
pub enum WebError {
    /// Engine refused the request.
    #[error(transparent)]
    Rejected(#[from] TriggerRejection),

    /// Provisioning callback for a node nobody is tracking.
    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebError {
    fn status(&self) -> StatusCode {
        match self {
            WebError::Rejected(rejection) => StatusCode::from_u16(rejection.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            WebError::Provisioning(ProvisioningError::UnknownNode(_)) => StatusCode::NOT_FOUND,
            WebError::Provisioning(_) | WebError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &str {
        match self {
            WebError::Rejected(rejection) => &rejection.code,
            WebError::Provisioning(ProvisioningError::UnknownNode(_)) => "unknown_node",
            WebError::Provisioning(_) => "provisioning_error",
            WebError::Io(_) => "io_error",
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            WebError::Rejected(rejection) => rejection.message.clone(),
            other => other.to_string(),
        };
        let body = json!({
            "status": status.as_u16(),
            "code": self.code(),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}
