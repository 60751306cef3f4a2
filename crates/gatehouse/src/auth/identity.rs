//! Identity capability consumed by the gate.
//!
//! The gate never talks to an identity provider directly. It only sees an
//! [`Identity`] in the request extensions (placed there by
//! [`identity_middleware`]) and calls [`IdentityProvider::challenge`] when it
//! wants the client sent through login.

use axum::{
    extract::{Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use log::debug;

use super::AuthMode;
use crate::gateway::AppState;

/// An authenticated end user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    subject: String,
}

impl Identity {
    /// Create an identity for a subject identifier.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    /// Stable subject identifier issued by the identity provider.
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Source of request authentication state.
pub trait IdentityProvider: Send + Sync {
    /// Resolve the authenticated identity of a request, if it has one.
    fn authenticate(&self, parts: &Parts) -> Option<Identity>;

    /// Response that sends the client to the login flow.
    fn challenge(&self, parts: &Parts) -> Response;
}

/// Annotate each request with its [`Identity`].
///
/// Any `Identity` already present in the extensions is discarded first so
/// nothing upstream of this layer can smuggle one in. In
/// [`AuthMode::Required`] unauthenticated requests are challenged here and
/// never reach the gate.
pub async fn identity_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    parts.extensions.remove::<Identity>();

    match state.identity.authenticate(&parts) {
        Some(identity) => {
            debug!("Request authenticated as {}", identity.subject());
            parts.extensions.insert(identity);
        }
        None if state.auth_mode == AuthMode::Required => {
            debug!("Unauthenticated request to {}, challenging", parts.uri.path());
            return state.identity.challenge(&parts);
        }
        None => {}
    }

    next.run(Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_exposes_subject() {
        let identity = Identity::new("auth0|123");
        assert_eq!(identity.subject(), "auth0|123");
        assert_eq!(identity, Identity::new(String::from("auth0|123")));
    }
}
