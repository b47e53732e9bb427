use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::common::SessionStatus;
use crate::server::services::{IdentityError, LoginFlowError, StoreError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Expiry is an expected outcome, so it is reported with a 200.
    #[error("Session expired: {0}")]
    Expired(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Identity provider error: {0}")]
    IdentityProvider(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ServerError::Expired(msg) => {
                tracing::debug!(reason = %msg, "Reporting expired session");
                let body = Json(json!({
                    "success": false,
                    "status": SessionStatus::Expired,
                }));
                return (StatusCode::OK, body).into_response();
            }
            ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ServerError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ServerError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ServerError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ServerError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ServerError::IdentityProvider(msg) => (StatusCode::BAD_GATEWAY, msg),
            ServerError::StoreUnavailable(msg)
            | ServerError::Signing(msg)
            | ServerError::Configuration(msg)
            | ServerError::Internal(msg) => {
                // Details stay in the log; callers get a generic failure.
                tracing::error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<LoginFlowError> for ServerError {
    fn from(err: LoginFlowError) -> Self {
        match err {
            LoginFlowError::NotFound(id) => {
                ServerError::NotFound(format!("Unknown login session {}", id))
            }
            LoginFlowError::Expired(id) => ServerError::Expired(id),
            LoginFlowError::Conflict(msg) => ServerError::Conflict(msg),
            LoginFlowError::InvalidTransition { from, to } => {
                ServerError::Conflict(format!("Cannot move session from {} to {}", from, to))
            }
            LoginFlowError::Store(e) => e.into(),
            LoginFlowError::Signing(e) => ServerError::Signing(e.to_string()),
            LoginFlowError::Inconsistent(msg) => ServerError::Internal(msg),
            LoginFlowError::UnknownUser(_) => {
                ServerError::Unauthorized("Token does not match a known user".to_string())
            }
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        ServerError::StoreUnavailable(err.to_string())
    }
}

impl From<IdentityError> for ServerError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::MissingIdentity => ServerError::BadRequest(err.to_string()),
            IdentityError::Mismatch { .. } => ServerError::Forbidden(err.to_string()),
            IdentityError::Http(_) | IdentityError::Upstream { .. } => {
                ServerError::IdentityProvider(err.to_string())
            }
        }
    }
}

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        ServerError::Configuration(format!("Configuration error: {}", err))
    }
}
