//! Per-request access decision.
//!
//! Rules, first match wins:
//! 1. A non-empty bypass header is allowed iff it matches a bypass token,
//!    otherwise denied. Identity is not consulted.
//! 2. An unauthenticated request is challenged if the client accepts HTML,
//!    otherwise denied.
//! 3. An authenticated request is allowed iff its subject is allow-listed.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::ACCEPT, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::{debug, info};

use super::Identity;
use crate::access::AccessSnapshot;
use crate::gateway::AppState;

/// Header carrying a pre-shared bypass token.
pub const BYPASS_HEADER: &str = "x-gatehouse-bypass";

/// Media ranges that mean the client can render an HTML login page.
const HTML_MEDIA_RANGES: &[&str] = &["text/html", "application/xhtml+xml", "text/*", "*/*"];

/// Gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request.
    Allow(Grant),
    /// Send the client through login.
    Challenge,
    /// Terminate with 403.
    Deny(DenyReason),
}

/// Why a request was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    BypassToken,
    AllowListedSubject,
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    InvalidBypassToken,
    Unauthenticated,
    SubjectNotAllowed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidBypassToken => "invalid bypass token",
            Self::Unauthenticated => "not authenticated",
            Self::SubjectNotAllowed => "subject not allow-listed",
        }
    }
}

/// The parts of a request the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    /// Raw bypass header value; `None` when absent or empty.
    pub bypass_token: Option<&'a [u8]>,
    pub identity: Option<&'a Identity>,
    pub accepts_html: bool,
}

impl<'a> GateRequest<'a> {
    /// Extract the gate inputs from request parts.
    pub fn from_parts(parts: &'a Parts) -> Self {
        let bypass_token = parts
            .headers
            .get(BYPASS_HEADER)
            .map(|value| value.as_bytes())
            .filter(|value| !value.is_empty());

        Self {
            bypass_token,
            identity: parts.extensions.get::<Identity>(),
            accepts_html: accepts_html(&parts.headers),
        }
    }
}

/// Decide access for one request against one snapshot.
pub fn decide(snapshot: &AccessSnapshot, request: &GateRequest<'_>) -> Decision {
    if let Some(token) = request.bypass_token {
        return if snapshot.is_bypass_token(token) {
            Decision::Allow(Grant::BypassToken)
        } else {
            Decision::Deny(DenyReason::InvalidBypassToken)
        };
    }

    match request.identity {
        None if request.accepts_html => Decision::Challenge,
        None => Decision::Deny(DenyReason::Unauthenticated),
        Some(identity) if snapshot.is_subject_allowed(identity.subject()) => {
            Decision::Allow(Grant::AllowListedSubject)
        }
        Some(_) => Decision::Deny(DenyReason::SubjectNotAllowed),
    }
}

/// Whether the `Accept` header admits an HTML response.
///
/// A missing header accepts anything. Ranges with `q=0` are ignored.
pub fn accepts_html(headers: &HeaderMap) -> bool {
    let mut saw_range = false;

    for value in headers.get_all(ACCEPT) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for range in value.split(',') {
            let mut params = range.split(';');
            let media_type = params.next().unwrap_or_default().trim();
            if media_type.is_empty() {
                continue;
            }
            saw_range = true;

            let rejected = params.any(|param| {
                param
                    .trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            if rejected {
                continue;
            }

            if HTML_MEDIA_RANGES
                .iter()
                .any(|html| media_type.eq_ignore_ascii_case(html))
            {
                return true;
            }
        }
    }

    !saw_range
}

/// Apply the gate before the forwarding handler.
pub async fn gate_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let snapshot = state.access.snapshot();
    let gate_request = GateRequest::from_parts(&parts);
    let decision = decide(&snapshot, &gate_request);
    let subject = gate_request.identity.map(Identity::subject);

    match decision {
        Decision::Allow(grant) => {
            debug!(
                "Allowed {} {} ({:?}, subject={:?})",
                parts.method,
                parts.uri.path(),
                grant,
                subject
            );
            next.run(Request::from_parts(parts, body)).await
        }
        Decision::Challenge => {
            debug!("Challenging {} {}", parts.method, parts.uri.path());
            state.identity.challenge(&parts)
        }
        Decision::Deny(reason) => {
            info!(
                "Denied {} {}: {} (subject={:?})",
                parts.method,
                parts.uri.path(),
                reason.as_str(),
                subject
            );
            forbidden()
        }
    }
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}
