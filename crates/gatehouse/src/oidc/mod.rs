//! OpenID Connect login backed by signed session cookies.
//!
//! The gateway runs the authorization code flow itself: `login` redirects to
//! the provider, `callback` redeems the code and sets the session cookie,
//! `logout` clears it. Requests are authenticated by verifying that cookie,
//! so no server-side session state exists.

mod discovery;
mod error;
mod handlers;
mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{StatusCode, header::LOCATION, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use log::debug;
use tokio::sync::OnceCell;

use crate::auth::{Identity, IdentityProvider};
use crate::config::OidcSettings;

pub use discovery::ProviderMetadata;
pub use error::OidcError;
pub use session::{SESSION_COOKIE, SessionKeys, TRANSACTION_COOKIE, cookie_value, safe_return_to};

/// Timeout for calls to the identity provider.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity provider speaking OpenID Connect.
pub struct OidcProvider {
    settings: OidcSettings,
    keys: SessionKeys,
    http: reqwest::Client,
    metadata: OnceCell<ProviderMetadata>,
}

impl OidcProvider {
    pub fn new(settings: OidcSettings) -> Result<Self, OidcError> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        Ok(Self {
            keys: SessionKeys::new(&settings.secret),
            settings,
            http,
            metadata: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    /// Provider metadata, discovered on first use.
    ///
    /// A failed discovery is not cached; the next login tries again.
    pub async fn metadata(&self) -> Result<&ProviderMetadata, OidcError> {
        self.metadata
            .get_or_try_init(|| discovery::discover(&self.http, &self.settings.issuer))
            .await
    }

    /// Routes for login, callback and logout at their configured paths.
    pub fn routes<S>(self: Arc<Self>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let routes = self.settings.routes.clone();
        Router::new()
            .route(&routes.login, get(handlers::login))
            .route(&routes.callback, get(handlers::callback))
            .route(&routes.logout, get(handlers::logout))
            .with_state(self)
    }
}

impl IdentityProvider for OidcProvider {
    fn authenticate(&self, parts: &Parts) -> Option<Identity> {
        let token = cookie_value(&parts.headers, SESSION_COOKIE)?;
        match self.keys.verify_session(token) {
            Ok(claims) => Some(Identity::new(claims.sub)),
            Err(err) => {
                debug!("Ignoring invalid session cookie: {}", err);
                None
            }
        }
    }

    fn challenge(&self, parts: &Parts) -> Response {
        let return_to = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!(
            "{}?returnTo={}",
            self.settings.routes.login,
            urlencoding::encode(return_to)
        );
        (StatusCode::FOUND, [(LOCATION, location)]).into_response()
    }
}
