//! Relay errors.

use axum::{
    http::{StatusCode, header::InvalidHeaderValue},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use super::UpstreamError;

/// A forwarded request could not be relayed.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("upstream request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("invalid outbound header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(UpstreamError::ConnectTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Only the status reaches the client; the cause is logged by the caller.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, status.canonical_reason().unwrap_or_default()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_timeout_maps_to_gateway_timeout() {
        let err = ProxyError::Upstream(UpstreamError::ConnectTimeout("app:8080".to_string()));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn other_failures_map_to_bad_gateway() {
        let err = ProxyError::Upstream(UpstreamError::Connect {
            authority: "app:8080".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        });
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
