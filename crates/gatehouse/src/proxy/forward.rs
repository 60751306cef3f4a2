//! Plain HTTP request/response relay.
//!
//! Bodies are handed to hyper as streams in both directions, so nothing is
//! buffered beyond what the connection itself holds and backpressure from a
//! slow reader reaches the other side.

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderValue, Request, Response, Uri, Version,
        header::{CONNECTION, HOST},
        request::Parts,
        uri::PathAndQuery,
    },
};

use super::{ProxyError, Upstream, UpstreamTarget};

/// Relay one request to the upstream over a fresh connection.
///
/// A failed connection attempt is not retried.
pub async fn forward(upstream: &Upstream, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
    let (parts, body) = req.into_parts();
    let outbound = outbound_request(upstream.target(), parts, body, false)?;

    let mut sender = upstream.handshake().await?;
    let response = sender
        .send_request(outbound)
        .await
        .map_err(ProxyError::Request)?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Rewrite an inbound request for the upstream connection.
///
/// Method, path, query, body and extensions are kept as-is. `Host` and
/// `Connection` are regenerated for the new connection; every other header
/// passes through.
pub(crate) fn outbound_request(
    target: &UpstreamTarget,
    mut parts: Parts,
    body: Body,
    upgrade: bool,
) -> Result<Request<Body>, ProxyError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path_and_query);
    parts.version = Version::HTTP_11;

    // Rebuilt rather than edited in place: removal would reorder the rest.
    let inbound = std::mem::take(&mut parts.headers);
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    let mut current = None;
    for (name, value) in inbound {
        if let Some(name) = name {
            current = Some(name);
        }
        match &current {
            Some(name) if name != HOST && name != CONNECTION => {
                headers.append(name.clone(), value);
            }
            _ => {}
        }
    }
    headers.append(HOST, HeaderValue::from_str(&target.authority())?);
    if upgrade {
        headers.append(CONNECTION, HeaderValue::from_static("upgrade"));
    }
    parts.headers = headers;

    Ok(Request::from_parts(parts, body))
}
