use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Message shown for every dead redemption link. Expired, consumed and
/// nonce-mismatched links must read the same to the caller.
pub const LINK_GONE_MESSAGE: &str = "This key page has been used or is invalid";

/// Redemption-related errors with API error codes
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RedeemError {
    #[error("No keys available, try again later")]
    PoolExhausted,

    #[error("You already claimed a key")]
    AlreadyClaimed,

    #[error("{}", LINK_GONE_MESSAGE)]
    Expired,

    #[error("{}", LINK_GONE_MESSAGE)]
    AlreadyConsumed,

    #[error("{}", LINK_GONE_MESSAGE)]
    Forbidden,

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Missing access key")]
    MissingCredential,

    #[error("Access key is not valid")]
    UnknownCredential,

    #[error("Access key is bound to another requester")]
    IdentityMismatch,

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl RedeemError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage(error.to_string())
    }

    /// Convert error to HTTP status code
    pub fn to_err_code(&self) -> StatusCode {
        match self {
            RedeemError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            RedeemError::AlreadyClaimed
            | RedeemError::Forbidden
            | RedeemError::UnknownCredential
            | RedeemError::IdentityMismatch => StatusCode::FORBIDDEN,
            RedeemError::Expired => StatusCode::NOT_FOUND,
            RedeemError::AlreadyConsumed => StatusCode::GONE,
            RedeemError::Malformed(_) => StatusCode::BAD_REQUEST,
            RedeemError::MissingCredential => StatusCode::UNAUTHORIZED,
            RedeemError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RedeemError {
    fn into_response(self) -> Response {
        let status = self.to_err_code();
        // storage details stay in the logs
        let message = match &self {
            RedeemError::Storage(_) => "Internal error".to_string(),
            other => other.to_string(),
        };
        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
