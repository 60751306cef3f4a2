//! Gateway configuration.
//!
//! Layered with the `config` crate: struct defaults, then an optional TOML
//! file, then `GATEHOUSE__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::access::DEFAULT_RELOAD_INTERVAL;
use crate::auth::AuthMode;
use crate::proxy::DEFAULT_CONNECT_TIMEOUT;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "GATEHOUSE";

/// Placeholder printed instead of secret values.
const REDACTED: &str = "<redacted>";

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required setting is not set.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// Environment variable not found (for `env:VAR_NAME` syntax).
    #[error("environment variable '{0}' not found (referenced via env:{0} in config)")]
    EnvVarNotFound(String),

    /// Environment variable is empty (for `env:VAR_NAME` syntax).
    #[error("environment variable '{0}' is empty (referenced via env:{0} in config)")]
    EnvVarEmpty(String),

    #[error("invalid URL in `{key}`: {reason}")]
    InvalidUrl { key: &'static str, reason: String },

    #[error("route `{key}` must be an absolute path starting with '/', got {value:?}")]
    InvalidRoute { key: &'static str, value: String },

    #[error("unsupported oidc.response_type {0:?}, only \"code\" is supported")]
    UnsupportedResponseType(String),

    #[error("oidc.scope must include \"openid\"")]
    MissingOpenIdScope,

    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    #[error("cannot expand path {path:?}: {reason}")]
    PathExpansion { path: String, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub access: AccessConfig,
    pub auth: AuthConfig,
    pub oidc: OidcConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds to wait for in-flight connections on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            shutdown_grace_secs: 10,
        }
    }
}

/// Upstream service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL: scheme, host and optional port only.
    pub url: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

/// Access file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Path to the access file. `~` and `$VAR` are expanded.
    pub file: Option<String>,
    pub reload_interval_secs: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            file: None,
            reload_interval_secs: DEFAULT_RELOAD_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
}

/// OpenID Connect client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Public URL of this gateway; the callback URL is derived from it.
    pub base_url: Option<String>,
    /// Session signing secret. Supports `env:VAR_NAME`.
    pub secret: Option<String>,
    pub client_id: Option<String>,
    /// Supports `env:VAR_NAME`.
    pub client_secret: Option<String>,
    pub issuer_base_url: Option<String>,
    pub routes: OidcRoutes,
    pub scope: String,
    pub response_type: String,
    /// Also end the session at the identity provider on logout.
    pub idp_logout: bool,
    pub session_ttl_secs: u64,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            secret: None,
            client_id: None,
            client_secret: None,
            issuer_base_url: None,
            routes: OidcRoutes::default(),
            scope: "openid profile email".to_string(),
            response_type: "code".to_string(),
            idp_logout: true,
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Paths served by the gateway itself for the login flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcRoutes {
    pub callback: String,
    pub login: String,
    pub logout: String,
    pub post_logout_redirect: String,
}

impl Default for OidcRoutes {
    fn default() -> Self {
        Self {
            callback: "/oauth2/callback".to_string(),
            login: "/oauth2/login".to_string(),
            logout: "/oauth2/logout".to_string(),
            post_logout_redirect: "/".to_string(),
        }
    }
}

/// Validated OIDC settings with secrets resolved.
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub base_url: Url,
    pub secret: String,
    pub client_id: String,
    pub client_secret: String,
    pub issuer: Url,
    pub routes: OidcRoutes,
    pub scope: String,
    pub idp_logout: bool,
    pub session_ttl: Duration,
}

impl OidcSettings {
    /// Absolute URL for a gateway-relative path.
    pub fn absolute_url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{}{}", base, path)
    }

    /// The redirect URI registered with the identity provider.
    pub fn redirect_uri(&self) -> String {
        self.absolute_url(&self.routes.callback)
    }

    /// Whether cookies must carry the `Secure` attribute.
    pub fn secure_cookies(&self) -> bool {
        self.base_url.scheme() == "https"
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file and the environment.
    ///
    /// A missing file is an error only when `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(required))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Check everything that can be checked without I/O.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream_url()?;
        self.access_file()?;
        if self.access.reload_interval_secs == 0 {
            return Err(ConfigError::Zero("access.reload_interval_secs"));
        }
        if self.upstream.connect_timeout_secs == 0 {
            return Err(ConfigError::Zero("upstream.connect_timeout_secs"));
        }
        self.oidc.resolve()?;
        Ok(())
    }

    pub fn upstream_url(&self) -> Result<&str, ConfigError> {
        self.upstream
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing("upstream.url"))
    }

    /// Access file path with `~` and environment variables expanded.
    pub fn access_file(&self) -> Result<PathBuf, ConfigError> {
        let raw = self
            .access
            .file
            .as_deref()
            .filter(|file| !file.is_empty())
            .ok_or(ConfigError::Missing("access.file"))?;
        let expanded = shellexpand::full(raw).map_err(|err| ConfigError::PathExpansion {
            path: raw.to_string(),
            reason: err.to_string(),
        })?;
        Ok(PathBuf::from(expanded.into_owned()))
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.access.reload_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    /// Copy with literal secrets replaced; `env:` references are kept.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        let secrets = [&mut config.oidc.secret, &mut config.oidc.client_secret];
        for value in secrets.into_iter().flatten() {
            if !value.starts_with("env:") {
                *value = REDACTED.to_string();
            }
        }
        config
    }
}

impl OidcConfig {
    /// Validate the OIDC settings and resolve `env:` secrets.
    pub fn resolve(&self) -> Result<OidcSettings, ConfigError> {
        let base_url = parse_url("oidc.base_url", required("oidc.base_url", &self.base_url)?)?;
        let issuer = parse_url(
            "oidc.issuer_base_url",
            required("oidc.issuer_base_url", &self.issuer_base_url)?,
        )?;
        let secret = resolve_secret(required("oidc.secret", &self.secret)?)?;
        let client_id = required("oidc.client_id", &self.client_id)?.to_string();
        let client_secret =
            resolve_secret(required("oidc.client_secret", &self.client_secret)?)?;

        if self.response_type != "code" {
            return Err(ConfigError::UnsupportedResponseType(
                self.response_type.clone(),
            ));
        }
        if !self.scope.split_whitespace().any(|scope| scope == "openid") {
            return Err(ConfigError::MissingOpenIdScope);
        }
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::Zero("oidc.session_ttl_secs"));
        }

        let routes = &self.routes;
        for (key, value) in [
            ("oidc.routes.callback", &routes.callback),
            ("oidc.routes.login", &routes.login),
            ("oidc.routes.logout", &routes.logout),
            ("oidc.routes.post_logout_redirect", &routes.post_logout_redirect),
        ] {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidRoute {
                    key,
                    value: value.clone(),
                });
            }
        }

        Ok(OidcSettings {
            base_url,
            secret,
            client_id,
            client_secret,
            issuer,
            routes: routes.clone(),
            scope: self.scope.clone(),
            idp_logout: self.idp_logout,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
        })
    }
}

fn required<'a>(key: &'static str, value: &'a Option<String>) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        key,
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            key,
            reason: format!("scheme must be http or https, got {:?}", url.scheme()),
        });
    }
    Ok(url)
}

/// Resolve a secret value, expanding `env:VAR_NAME` syntax.
pub fn resolve_secret(value: &str) -> Result<String, ConfigError> {
    let Some(var_name) = value.strip_prefix("env:") else {
        return Ok(value.to_string());
    };
    match std::env::var(var_name) {
        Ok(secret) if !secret.is_empty() => Ok(secret),
        Ok(_) => Err(ConfigError::EnvVarEmpty(var_name.to_string())),
        Err(_) => Err(ConfigError::EnvVarNotFound(var_name.to_string())),
    }
}
