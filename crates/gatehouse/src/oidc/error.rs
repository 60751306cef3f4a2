//! Login flow errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::warn;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the OpenID Connect login flow.
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("identity provider returned {error}: {description}")]
    Provider { error: String, description: String },

    #[error("login transaction cookie missing")]
    MissingTransaction,

    #[error("login transaction invalid: {0}")]
    InvalidTransaction(jsonwebtoken::errors::Error),

    #[error("state parameter does not match login transaction")]
    StateMismatch,

    #[error("authorization code missing from callback")]
    MissingCode,

    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("issuer mismatch: configured {configured}, discovered {discovered}")]
    IssuerMismatch {
        configured: String,
        discovered: String,
    },

    #[error("invalid provider endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("token endpoint returned {0}")]
    TokenEndpoint(reqwest::StatusCode),

    #[error("token response has no id_token")]
    MissingIdToken,

    #[error("no signing key matches the id_token")]
    UnknownSigningKey,

    #[error("id_token invalid: {0}")]
    IdToken(#[from] jsonwebtoken::errors::Error),

    #[error("id_token nonce does not match login transaction")]
    NonceMismatch,

    #[error("cannot sign cookie: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

impl OidcError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OidcError::Provider { .. }
            | OidcError::MissingTransaction
            | OidcError::InvalidTransaction(_)
            | OidcError::StateMismatch
            | OidcError::MissingCode => StatusCode::BAD_REQUEST,
            OidcError::IdToken(_) | OidcError::UnknownSigningKey | OidcError::NonceMismatch => {
                StatusCode::UNAUTHORIZED
            }
            OidcError::Http(_)
            | OidcError::IssuerMismatch { .. }
            | OidcError::InvalidEndpoint { .. }
            | OidcError::TokenEndpoint(_)
            | OidcError::MissingIdToken => StatusCode::BAD_GATEWAY,
            OidcError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            OidcError::Provider { .. } => "login_rejected",
            OidcError::MissingTransaction
            | OidcError::InvalidTransaction(_)
            | OidcError::StateMismatch
            | OidcError::MissingCode => "invalid_callback",
            OidcError::IdToken(_) | OidcError::UnknownSigningKey | OidcError::NonceMismatch => {
                "invalid_id_token"
            }
            OidcError::Http(_)
            | OidcError::IssuerMismatch { .. }
            | OidcError::InvalidEndpoint { .. }
            | OidcError::TokenEndpoint(_)
            | OidcError::MissingIdToken => "provider_unavailable",
            OidcError::Signing(_) => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct OidcErrorResponse {
    error_code: &'static str,
}

impl IntoResponse for OidcError {
    fn into_response(self) -> Response {
        // Details stay in the log; the client only learns the category.
        warn!("Login flow failed: {}", self);
        let body = OidcErrorResponse {
            error_code: self.error_code(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_problems_are_client_errors() {
        assert_eq!(
            OidcError::StateMismatch.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OidcError::MissingTransaction.error_code(),
            "invalid_callback"
        );
    }

    #[test]
    fn provider_failures_are_gateway_errors() {
        let err = OidcError::TokenEndpoint(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.error_code(), "provider_unavailable");
        assert_eq!(
            OidcError::NonceMismatch.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
