//! Protocol-upgrade (WebSocket) forwarding.
//!
//! The handshake is relayed like any other request. If the upstream answers
//! `101 Switching Protocols`, both connections are taken over from hyper and
//! raw bytes are copied between them until one side closes.

use axum::{
    body::Body,
    http::{
        HeaderMap, Request, Response, StatusCode,
        header::{CONNECTION, UPGRADE},
    },
};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use log::{debug, warn};

use super::forward::{forward, outbound_request};
use super::{ProxyError, Upstream};

/// Whether a request asks to switch protocols.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Relay an upgrade handshake and, on success, tunnel the connection.
pub async fn forward_upgrade(
    upstream: &Upstream,
    mut req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let Some(client_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        debug!("Inbound connection cannot be upgraded, relaying as a plain request");
        return forward(upstream, req).await;
    };

    let (parts, body) = req.into_parts();
    let outbound = outbound_request(upstream.target(), parts, body, true)?;

    let mut sender = upstream.handshake().await?;
    let mut response = sender
        .send_request(outbound)
        .await
        .map_err(ProxyError::Request)?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!("Upstream declined upgrade with {}", response.status());
        let (parts, body) = response.into_parts();
        return Ok(Response::from_parts(parts, Body::new(body)));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client, upstream)) => tunnel(client, upstream).await,
            Err(err) => warn!("Connection upgrade failed: {}", err),
        }
    });

    let (parts, _) = response.into_parts();
    Ok(Response::from_parts(parts, Body::empty()))
}

/// Copy bytes both ways; when either direction ends, both connections are
/// dropped and therefore closed.
async fn tunnel(client: Upgraded, upstream: Upgraded) {
    let (mut client_rx, mut client_tx) = tokio::io::split(TokioIo::new(client));
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(TokioIo::new(upstream));

    let client_to_upstream = tokio::io::copy(&mut client_rx, &mut upstream_tx);
    let upstream_to_client = tokio::io::copy(&mut upstream_rx, &mut client_tx);

    tokio::select! {
        result = client_to_upstream => match result {
            Ok(bytes) => debug!("Tunnel closed by client after {} bytes upstream", bytes),
            Err(err) => debug!("Tunnel client side failed: {}", err),
        },
        result = upstream_to_client => match result {
            Ok(bytes) => debug!("Tunnel closed by upstream after {} bytes downstream", bytes),
            Err(err) => debug!("Tunnel upstream side failed: {}", err),
        },
    }
}
