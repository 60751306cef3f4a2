//! Request authentication and authorization.
//!
//! [`identity_middleware`] resolves who the caller is; [`gate_middleware`]
//! decides whether the request may be forwarded.

mod gate;
mod identity;

use serde::{Deserialize, Serialize};

pub use gate::{
    BYPASS_HEADER, Decision, DenyReason, GateRequest, Grant, accepts_html, decide,
    gate_middleware,
};
pub use identity::{Identity, IdentityProvider, identity_middleware};

/// Where unauthenticated requests are stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Every request must be authenticated; unauthenticated ones are sent to
    /// login before the gate runs.
    Required,
    /// Authentication is optional; the gate handles bypass tokens,
    /// challenges and denials.
    #[default]
    Optional,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Required => "required",
            AuthMode::Optional => "optional",
        }
    }
}
