//! Error handling for the claim server.

use crate::rate_limit::LimitBucket;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Message returned for every retryable distribution failure. Treasury state stays server-side.
const TRY_AGAIN_LATER: &str =
    "Token claiming is temporarily unavailable. Please try again in a few minutes.";

/// Which side of the distributor's treasury ran short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundsShortage {
    Token,
    Gas,
    Both,
}

/// Claim server error types
#[derive(Error, Debug)]
pub enum ClaimError {
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Invalid Ethereum address: {0}")]
    InvalidEthereumAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded for {bucket}; retry in {}s", .retry_after.as_secs())]
    RateLimited {
        bucket: LimitBucket,
        retry_after: Duration,
    },

    #[error("Verification code not found")]
    CodeNotFound,

    #[error("Verification code expired")]
    CodeExpired,

    #[error("Verification code already used")]
    CodeAlreadyUsed,

    #[error("Too many verification attempts")]
    TooManyAttempts,

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Invalid or expired session")]
    Unauthorized,

    #[error("Admin authentication required")]
    AdminUnauthorized,

    #[error("No signing challenge found")]
    NonceNotFound,

    #[error("Signing challenge already used")]
    NonceConsumed,

    #[error("Signing challenge expired")]
    NonceExpired,

    #[error("Signature rejected: {0}")]
    InvalidSignature(String),

    #[error("No allocation found")]
    AllocationNotFound,

    #[error("Token contract unhealthy: {0}")]
    Unavailable(String),

    #[error("Distributor has insufficient funds ({0:?})")]
    InsufficientFunds(FundsShortage),

    #[error("Estimated gas cost {estimated_wei} wei exceeds cap {max_wei} wei")]
    GasTooHigh { estimated_wei: String, max_wei: String },

    #[error("RPC call timed out: {0}")]
    RpcTimeout(&'static str),

    #[error("Transfer {0} is awaiting confirmation")]
    TransferPending(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Chain error: {0}")]
    Chain(#[from] crate::eth::ChainError),

    #[error("Email sending failed: {0}")]
    EmailError(#[from] lettre::transport::smtp::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClaimError {
    /// Whether the caller may retry the same request later and expect a different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClaimError::RateLimited { .. }
                | ClaimError::Unavailable(_)
                | ClaimError::InsufficientFunds(_)
                | ClaimError::GasTooHigh { .. }
                | ClaimError::RpcTimeout(_)
                | ClaimError::TransferPending(_)
                | ClaimError::Chain(_)
        )
    }

    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ClaimError::InvalidEmail(_)
            | ClaimError::InvalidEthereumAddress(_)
            | ClaimError::InvalidAmount(_)
            | ClaimError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ClaimError::RateLimited { retry_after, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "Rate limit exceeded. Try again in {} seconds.",
                    retry_after.as_secs().max(1)
                ),
            ),
            ClaimError::CodeNotFound => (
                StatusCode::BAD_REQUEST,
                "No active code. Please request a new one.".to_string(),
            ),
            ClaimError::CodeExpired => (
                StatusCode::BAD_REQUEST,
                "That code has expired. Please request a new one.".to_string(),
            ),
            ClaimError::CodeAlreadyUsed => (
                StatusCode::BAD_REQUEST,
                "That code has already been used.".to_string(),
            ),
            ClaimError::TooManyAttempts => (
                StatusCode::BAD_REQUEST,
                "Too many attempts. Please request a new code.".to_string(),
            ),
            ClaimError::InvalidCode => (
                StatusCode::BAD_REQUEST,
                "Invalid verification code.".to_string(),
            ),
            ClaimError::Unauthorized | ClaimError::AdminUnauthorized => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            ClaimError::NonceNotFound => (
                StatusCode::BAD_REQUEST,
                "No nonce found. Please request a new challenge.".to_string(),
            ),
            ClaimError::NonceConsumed => (
                StatusCode::BAD_REQUEST,
                "Nonce already used. Please request a new challenge.".to_string(),
            ),
            ClaimError::NonceExpired => (
                StatusCode::BAD_REQUEST,
                "Nonce expired. Please request a new challenge.".to_string(),
            ),
            ClaimError::InvalidSignature(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ClaimError::AllocationNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ClaimError::Unavailable(_)
            | ClaimError::InsufficientFunds(_)
            | ClaimError::GasTooHigh { .. }
            | ClaimError::RpcTimeout(_)
            | ClaimError::TransferPending(_)
            | ClaimError::Chain(_) => (StatusCode::SERVICE_UNAVAILABLE, TRY_AGAIN_LATER.to_string()),
            ClaimError::TransferFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Claim failed. Please contact support before retrying.".to_string(),
            ),
            ClaimError::EmailError(_) | ClaimError::Storage(_) | ClaimError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            ClaimError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
            ),
        }
    }
}

impl IntoResponse for ClaimError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_message) = self.status_and_message();

        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Request throttled: {}", self);
        }

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        let mut response = (status, body).into_response();
        match &self {
            ClaimError::RateLimited { retry_after, .. } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            ClaimError::AdminUnauthorized => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
            }
            _ => {}
        }
        response
    }
}

/// Result type alias for claim operations
pub type ClaimResult<T> = Result<T, ClaimError>;
