//! Signed cookies for the login transaction and the user session.
//!
//! Both are HS256 JWTs keyed with the configured session secret. They carry
//! different audiences so one can never be replayed as the other.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, header::COOKIE};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Cookie holding the authenticated session.
pub const SESSION_COOKIE: &str = "gatehouse_session";

/// Cookie holding state and nonce while the user is at the provider.
pub const TRANSACTION_COOKIE: &str = "gatehouse_auth";

/// How long a login may take between redirect and callback.
pub const TRANSACTION_TTL: Duration = Duration::from_secs(10 * 60);

const SESSION_AUDIENCE: &str = "gatehouse:session";
const TRANSACTION_AUDIENCE: &str = "gatehouse:transaction";

/// Claims stored in the session cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims stored in the login transaction cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionClaims {
    pub state: String,
    pub nonce: String,
    pub return_to: String,
    pub aud: String,
    pub exp: i64,
}

/// HS256 keys derived from the session secret.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a session token for a subject.
    pub fn sign_session(
        &self,
        subject: &str,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: subject.to_string(),
            aud: SESSION_AUDIENCE.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    pub fn verify_session(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        decode::<SessionClaims>(token, &self.decoding, &validation(SESSION_AUDIENCE))
            .map(|data| data.claims)
    }

    /// Issue the short-lived transaction token for a login redirect.
    pub fn sign_transaction(
        &self,
        state: &str,
        nonce: &str,
        return_to: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = TransactionClaims {
            state: state.to_string(),
            nonce: nonce.to_string(),
            return_to: return_to.to_string(),
            aud: TRANSACTION_AUDIENCE.to_string(),
            exp: Utc::now().timestamp() + TRANSACTION_TTL.as_secs() as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    pub fn verify_transaction(
        &self,
        token: &str,
    ) -> Result<TransactionClaims, jsonwebtoken::errors::Error> {
        decode::<TransactionClaims>(token, &self.decoding, &validation(TRANSACTION_AUDIENCE))
            .map(|data| data.claims)
    }
}

fn validation(audience: &str) -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "aud"]);
    validation
}

/// Find a cookie by name across all `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim())
        })
}

/// `Set-Cookie` value for an HTTP-only, lax, site-wide cookie.
pub fn set_cookie(name: &str, value: &str, max_age: Duration, secure: bool) -> HeaderValue {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        name,
        value,
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    // Names are constants and values are base64url JWTs.
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// `Set-Cookie` value that removes a cookie.
pub fn clear_cookie(name: &str, secure: bool) -> HeaderValue {
    set_cookie(name, "", Duration::ZERO, secure)
}

/// Random URL-safe string for `state` and `nonce`.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Accept only same-origin relative paths as post-login targets.
pub fn safe_return_to(raw: Option<&str>) -> String {
    match raw {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.starts_with("/\\")
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}
