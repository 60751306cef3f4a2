//! Forwarding of allowed requests to the upstream.
//!
//! Every request gets its own upstream connection. Ordinary requests are
//! relayed with streaming bodies; upgrade requests are relayed and then
//! tunneled as raw bytes.

mod error;
mod forward;
mod upgrade;
mod upstream;

use axum::{
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use log::warn;

use crate::gateway::AppState;

pub use error::ProxyError;
pub use forward::forward;
pub use upgrade::{forward_upgrade, is_upgrade_request};
pub use upstream::{DEFAULT_CONNECT_TIMEOUT, Scheme, Upstream, UpstreamError, UpstreamTarget};

/// Fallback handler relaying everything the gate lets through.
pub async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = if is_upgrade_request(req.headers()) {
        forward_upgrade(&state.upstream, req).await
    } else {
        forward(&state.upstream, req).await
    };

    result.unwrap_or_else(|err| {
        warn!("Relay of {} {} failed: {}", method, path, err);
        err.into_response()
    })
}
