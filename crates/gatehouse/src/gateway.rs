//! Composition root: wires the access store, identity layer, gate and
//! forwarding engine around the listener.

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto, graceful::GracefulShutdown},
    service::TowerToHyperService,
};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::access::{AccessError, AccessStore};
use crate::auth::{AuthMode, IdentityProvider, gate_middleware, identity_middleware};
use crate::config::{AppConfig, ConfigError};
use crate::oidc::{OidcError, OidcProvider};
use crate::proxy::{Upstream, UpstreamError, UpstreamTarget, proxy_handler};

/// Shared state handed to the middleware and the forwarding handler.
#[derive(Clone)]
pub struct AppState {
    pub access: AccessStore,
    pub identity: Arc<dyn IdentityProvider>,
    pub upstream: Arc<Upstream>,
    pub auth_mode: AuthMode,
}

/// Startup failures. All of them are fatal.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid upstream: {0}")]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("cannot set up OpenID Connect client: {0}")]
    Oidc(#[from] OidcError),
}

/// A fully configured gateway, ready to serve.
pub struct Gateway {
    state: AppState,
    auth_routes: Router,
    reload_interval: Duration,
}

impl Gateway {
    /// Validate configuration, resolve the upstream and perform the initial
    /// access file load.
    pub async fn from_config(config: &AppConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let target = UpstreamTarget::parse(config.upstream_url()?)?;
        let upstream = Upstream::new(target, config.connect_timeout())?;
        info!("Using upstream {}", upstream.target().authority());

        let access = AccessStore::open(config.access_file()?).await?;

        let oidc = Arc::new(OidcProvider::new(config.oidc.resolve()?)?);
        let auth_routes = Arc::clone(&oidc).routes();

        let state = AppState {
            access,
            identity: oidc,
            upstream: Arc::new(upstream),
            auth_mode: config.auth.mode,
        };
        Ok(Self::new(state, auth_routes, config.reload_interval()))
    }

    /// Assemble a gateway from already-built parts.
    pub fn new(state: AppState, auth_routes: Router, reload_interval: Duration) -> Self {
        Self {
            state,
            auth_routes,
            reload_interval,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), self.auth_routes.clone())
    }

    /// Serve until `shutdown` fires, reloading the access file meanwhile.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken, grace: Duration) {
        let reloader = self
            .state
            .access
            .spawn_reloader(self.reload_interval, shutdown.child_token());

        serve(listener, self.router(), shutdown.clone(), grace).await;

        shutdown.cancel();
        if let Err(err) = reloader.await {
            warn!("Access reload task ended abnormally: {}", err);
        }
    }
}

/// Build the request pipeline.
///
/// `auth_routes` are served as-is. Everything else passes the identity layer
/// and the gate before it is forwarded.
pub fn router(state: AppState, auth_routes: Router) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Layers run bottom-up: identity first, then the gate.
    let proxied = Router::new()
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), gate_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), identity_middleware))
        .with_state(state);

    auth_routes.fallback_service(proxied).layer(trace_layer)
}

/// Accept connections until `shutdown` fires, then give in-flight
/// connections up to `grace` to finish.
///
/// HTTP/1 header case is preserved and connections may be upgraded, which
/// `axum::serve` does not offer together.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken, grace: Duration) {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    let graceful = GracefulShutdown::new();

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Failed to accept connection: {}", err);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("Cannot set TCP_NODELAY for {}: {}", peer, err);
        }

        let service = TowerToHyperService::new(app.clone());
        let conn = builder
            .serve_connection_with_upgrades(TokioIo::new(stream), service)
            .into_owned();
        let conn = graceful.watch(conn);

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Connection from {} ended with error: {}", peer, err);
            }
        });
    }

    drop(listener);
    info!("Stopped accepting connections, draining");

    tokio::select! {
        _ = graceful.shutdown() => info!("All connections closed"),
        _ = tokio::time::sleep(grace) => {
            warn!("Grace period of {:?} elapsed with connections still open", grace);
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
