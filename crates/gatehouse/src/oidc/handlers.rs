//! Login, callback and logout endpoints.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{AppendHeaders, IntoResponse, Response},
};
use log::{info, warn};
use serde::Deserialize;

use super::discovery::{authorization_url, exchange_code, logout_url, verify_id_token};
use super::session::{
    SESSION_COOKIE, TRANSACTION_COOKIE, TRANSACTION_TTL, clear_cookie, cookie_value,
    random_token, safe_return_to, set_cookie,
};
use super::{OidcError, OidcProvider};

#[derive(Debug, Deserialize)]
pub(crate) struct LoginQuery {
    #[serde(rename = "returnTo")]
    return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Start the code flow: remember state and nonce, send the browser away.
pub(crate) async fn login(
    State(provider): State<Arc<OidcProvider>>,
    Query(query): Query<LoginQuery>,
) -> Result<Response, OidcError> {
    let metadata = provider.metadata().await?;
    let settings = provider.settings();

    let return_to = safe_return_to(query.return_to.as_deref());
    let state = random_token();
    let nonce = random_token();

    let transaction = provider
        .keys
        .sign_transaction(&state, &nonce, &return_to)
        .map_err(OidcError::Signing)?;
    let location = authorization_url(metadata, settings, &state, &nonce)?;

    Ok(redirect(
        location.as_str(),
        [set_cookie(
            TRANSACTION_COOKIE,
            &transaction,
            TRANSACTION_TTL,
            settings.secure_cookies(),
        )],
    ))
}

/// Finish the code flow and establish the session.
pub(crate) async fn callback(
    State(provider): State<Arc<OidcProvider>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, OidcError> {
    if let Some(error) = query.error {
        return Err(OidcError::Provider {
            error,
            description: query.error_description.unwrap_or_default(),
        });
    }

    let transaction = cookie_value(&headers, TRANSACTION_COOKIE)
        .ok_or(OidcError::MissingTransaction)?;
    let transaction = provider
        .keys
        .verify_transaction(transaction)
        .map_err(OidcError::InvalidTransaction)?;

    if query.state.as_deref() != Some(transaction.state.as_str()) {
        return Err(OidcError::StateMismatch);
    }
    let code = query.code.ok_or(OidcError::MissingCode)?;

    let metadata = provider.metadata().await?;
    let settings = provider.settings();
    let id_token = exchange_code(&provider.http, metadata, settings, &code).await?;
    let claims =
        verify_id_token(&provider.http, metadata, settings, &id_token, &transaction.nonce).await?;

    let session = provider
        .keys
        .sign_session(&claims.sub, settings.session_ttl)
        .map_err(OidcError::Signing)?;
    info!("User {} logged in", claims.sub);

    let secure = settings.secure_cookies();
    Ok(redirect(
        &transaction.return_to,
        [
            set_cookie(SESSION_COOKIE, &session, settings.session_ttl, secure),
            clear_cookie(TRANSACTION_COOKIE, secure),
        ],
    ))
}

/// Drop the session and optionally end it at the provider too.
pub(crate) async fn logout(State(provider): State<Arc<OidcProvider>>) -> Response {
    let settings = provider.settings();
    let local = settings.routes.post_logout_redirect.clone();

    let location = if settings.idp_logout {
        let return_to = settings.absolute_url(&local);
        match provider.metadata().await {
            Ok(metadata) => match logout_url(metadata, settings, &return_to) {
                Ok(url) => url.to_string(),
                Err(err) => {
                    warn!("Skipping provider logout: {}", err);
                    local
                }
            },
            Err(err) => {
                warn!("Skipping provider logout: {}", err);
                local
            }
        }
    } else {
        local
    };

    redirect(
        &location,
        [clear_cookie(SESSION_COOKIE, settings.secure_cookies())],
    )
}

fn redirect<const N: usize>(location: &str, cookies: [HeaderValue; N]) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
        AppendHeaders(cookies.map(|cookie| (header::SET_COOKIE, cookie))),
    )
        .into_response()
}
