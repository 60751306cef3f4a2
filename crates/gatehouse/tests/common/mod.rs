//! Test utilities and common setup.
#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::Request,
    http::{HeaderValue, StatusCode, header::LOCATION, request::Parts},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use gatehouse::access::AccessStore;
use gatehouse::auth::{AuthMode, Identity, IdentityProvider};
use gatehouse::gateway::{self, AppState};
use gatehouse::proxy::{Upstream, UpstreamTarget};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Header the fake identity provider trusts as the authenticated subject.
pub const TEST_USER_HEADER: &str = "x-test-user";

/// Login URL the fake identity provider redirects to.
pub const TEST_LOGIN_URL: &str = "/login";

/// Identity provider that authenticates from a plain request header.
pub struct HeaderIdentity;

impl IdentityProvider for HeaderIdentity {
    fn authenticate(&self, parts: &Parts) -> Option<Identity> {
        parts
            .headers
            .get(TEST_USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(Identity::new)
    }

    fn challenge(&self, _parts: &Parts) -> Response {
        (StatusCode::FOUND, [(LOCATION, TEST_LOGIN_URL)]).into_response()
    }
}

/// Write an access file to a temp location.
pub fn access_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create access file");
    file.write_all(content.as_bytes()).expect("write access file");
    file.flush().expect("flush access file");
    file
}

/// Replace the contents of an access file.
pub fn rewrite_access_file(file: &NamedTempFile, content: &str) {
    std::fs::write(file.path(), content).expect("rewrite access file");
}

/// Build gateway state around a store and an upstream address.
pub fn app_state(access: AccessStore, upstream: SocketAddr, mode: AuthMode) -> AppState {
    let target = UpstreamTarget::parse(&format!("http://{}", upstream)).expect("upstream url");
    let upstream = Upstream::new(target, Duration::from_secs(5)).expect("upstream");
    AppState {
        access,
        identity: Arc::new(HeaderIdentity),
        upstream: Arc::new(upstream),
        auth_mode: mode,
    }
}

/// Router for a gateway without login routes.
pub async fn test_app(access: &NamedTempFile, upstream: SocketAddr, mode: AuthMode) -> Router {
    let store = AccessStore::open(access.path()).await.expect("open access store");
    gateway::router(app_state(store, upstream, mode), Router::new())
}

/// Serve a router on an ephemeral port.
pub async fn spawn_gateway(app: Router) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        gateway::serve(listener, app, token, Duration::from_secs(1)).await;
    });
    (addr, shutdown)
}

/// Address that refuses connections.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Upstream that answers every request with what it received.
///
/// Method, URI and header list come back in `x-echo-*` headers; the body is
/// streamed back unchanged.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let app = Router::new().fallback(echo);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn echo(req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let mut response = Response::new(Body::from_stream(body.into_data_stream()));
    let echoed = response.headers_mut();
    echoed.insert(
        "x-echo-method",
        HeaderValue::from_str(parts.method.as_str()).unwrap(),
    );
    echoed.insert(
        "x-echo-uri",
        HeaderValue::from_str(&parts.uri.to_string()).unwrap(),
    );
    echoed.insert(
        "x-echo-headers",
        HeaderValue::from_str(&serde_json::to_string(&headers).unwrap()).unwrap(),
    );
    echoed.insert("X-Upstream-Custom", HeaderValue::from_static("kept"));
    response
}

/// Headers the echo upstream saw, from its `x-echo-headers` response header.
pub fn echoed_headers(response: &Response) -> Vec<(String, String)> {
    let raw = response
        .headers()
        .get("x-echo-headers")
        .expect("x-echo-headers")
        .to_str()
        .unwrap();
    serde_json::from_str(raw).unwrap()
}

/// One-shot HTTP upstream on a bare socket; hands back the request
/// head exactly as it arrived on the wire.
pub async fn spawn_raw_http_upstream() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (head_tx, head_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = head_tx.send(head);

        stream
            .write_all(b"HTTP/1.1 200 OK\r\nX-Up-Case: v\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        let _ = stream.shutdown().await;
    });

    (addr, head_rx)
}

/// Upstream that accepts any upgrade and then echoes raw bytes.
///
/// The request head it received is sent on the returned channel.
pub async fn spawn_raw_upgrade_upstream() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (head_tx, head_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = head_tx.send(head);

        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: raw-test\r\n\r\n",
            )
            .await
            .unwrap();

        let (mut rx, mut tx) = stream.split();
        let _ = tokio::io::copy(&mut rx, &mut tx).await;
    });

    (addr, head_rx)
}

/// Upstream speaking WebSocket that echoes every data message.
pub async fn spawn_ws_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Read an HTTP/1 message head up to and including the blank line.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside message head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}
