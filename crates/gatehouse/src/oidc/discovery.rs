//! Provider discovery and the back-channel calls of the code flow.

use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    jwk::JwkSet,
};
use log::{debug, info};
use serde::Deserialize;
use url::Url;

use super::OidcError;
use crate::config::OidcSettings;

/// The subset of the discovery document the gateway uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Fetch `/.well-known/openid-configuration` below the issuer URL.
pub async fn discover(http: &reqwest::Client, issuer: &Url) -> Result<ProviderMetadata, OidcError> {
    let base = issuer.as_str().trim_end_matches('/');
    let url = format!("{}/.well-known/openid-configuration", base);
    debug!("Fetching provider metadata from {}", url);

    let metadata: ProviderMetadata = http
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if metadata.issuer.trim_end_matches('/') != base {
        return Err(OidcError::IssuerMismatch {
            configured: issuer.to_string(),
            discovered: metadata.issuer,
        });
    }

    info!("Discovered identity provider {}", metadata.issuer);
    Ok(metadata)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

/// Claims read from a verified ID token.
#[derive(Debug, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Redeem an authorization code and return the raw ID token.
pub async fn exchange_code(
    http: &reqwest::Client,
    metadata: &ProviderMetadata,
    settings: &OidcSettings,
    code: &str,
) -> Result<String, OidcError> {
    let redirect_uri = settings.redirect_uri();
    let response = http
        .post(&metadata.token_endpoint)
        .basic_auth(
            urlencoding::encode(&settings.client_id),
            Some(urlencoding::encode(&settings.client_secret)),
        )
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
        ])
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(OidcError::TokenEndpoint(response.status()));
    }

    let tokens: TokenResponse = response.json().await?;
    tokens.id_token.ok_or(OidcError::MissingIdToken)
}

/// Verify signature, issuer, audience, expiry and nonce of an ID token.
///
/// Asymmetric tokens are checked against the provider's JWKS; HMAC tokens
/// against the client secret.
pub async fn verify_id_token(
    http: &reqwest::Client,
    metadata: &ProviderMetadata,
    settings: &OidcSettings,
    id_token: &str,
    expected_nonce: &str,
) -> Result<IdTokenClaims, OidcError> {
    let header = decode_header(id_token)?;

    let key = match header.alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            DecodingKey::from_secret(settings.client_secret.as_bytes())
        }
        _ => {
            let jwks: JwkSet = http
                .get(&metadata.jwks_uri)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let jwk = match header.kid.as_deref() {
                Some(kid) => jwks.find(kid),
                None => jwks.keys.first(),
            }
            .ok_or(OidcError::UnknownSigningKey)?;
            DecodingKey::from_jwk(jwk)?
        }
    };

    let mut validation = Validation::new(header.alg);
    validation.set_issuer(&[metadata.issuer.as_str()]);
    validation.set_audience(&[settings.client_id.as_str()]);
    validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

    let claims = decode::<IdTokenClaims>(id_token, &key, &validation)?.claims;
    if claims.nonce.as_deref() != Some(expected_nonce) {
        return Err(OidcError::NonceMismatch);
    }
    Ok(claims)
}

/// Authorization request URL for the code flow.
pub fn authorization_url(
    metadata: &ProviderMetadata,
    settings: &OidcSettings,
    state: &str,
    nonce: &str,
) -> Result<Url, OidcError> {
    let mut url = parse_endpoint(&metadata.authorization_endpoint)?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &settings.client_id)
        .append_pair("redirect_uri", &settings.redirect_uri())
        .append_pair("scope", &settings.scope)
        .append_pair("state", state)
        .append_pair("nonce", nonce);
    Ok(url)
}

/// Where to send the browser to end the provider session.
///
/// Uses the standard `end_session_endpoint` when advertised and falls back
/// to Auth0's `/v2/logout`.
pub fn logout_url(
    metadata: &ProviderMetadata,
    settings: &OidcSettings,
    return_to: &str,
) -> Result<Url, OidcError> {
    match metadata.end_session_endpoint.as_deref() {
        Some(endpoint) => {
            let mut url = parse_endpoint(endpoint)?;
            url.query_pairs_mut()
                .append_pair("client_id", &settings.client_id)
                .append_pair("post_logout_redirect_uri", return_to);
            Ok(url)
        }
        None => {
            let base = metadata.issuer.trim_end_matches('/');
            let mut url = parse_endpoint(&format!("{}/v2/logout", base))?;
            url.query_pairs_mut()
                .append_pair("client_id", &settings.client_id)
                .append_pair("returnTo", return_to);
            Ok(url)
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, OidcError> {
    Url::parse(endpoint).map_err(|err| OidcError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    })
}
