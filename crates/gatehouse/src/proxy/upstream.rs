//! Upstream target and connection setup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

/// Default bound on establishing the upstream TCP (and TLS) connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream configuration and connection errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid upstream URL: scheme must be http or https, got {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid upstream URL: {0} must be empty")]
    UnexpectedComponent(&'static str),

    #[error("invalid upstream URL: missing host")]
    MissingHost,

    #[error("failed to set up TLS: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("connecting to upstream {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to upstream {0}")]
    ConnectTimeout(String),

    #[error("TLS handshake with upstream failed: {0}")]
    TlsHandshake(#[source] std::io::Error),

    #[error("HTTP handshake with upstream failed: {0}")]
    Handshake(#[source] hyper::Error),
}

/// Upstream URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The single service requests are forwarded to.
///
/// Resolved once at startup; the URL must consist of scheme, host and an
/// optional port only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl UpstreamTarget {
    /// Parse and validate an upstream base URL.
    pub fn parse(raw: &str) -> Result<Self, UpstreamError> {
        let url = Url::parse(raw)?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(UpstreamError::UnsupportedScheme(other.to_string())),
        };

        if !url.username().is_empty() || url.password().is_some() {
            return Err(UpstreamError::UnexpectedComponent("credentials"));
        }
        if !matches!(url.path(), "" | "/") {
            return Err(UpstreamError::UnexpectedComponent("path"));
        }
        if url.query().is_some() {
            return Err(UpstreamError::UnexpectedComponent("query"));
        }
        if url.fragment().is_some() {
            return Err(UpstreamError::UnexpectedComponent("fragment"));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(UpstreamError::MissingHost),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or IP address, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for the outbound `Host` header.
    ///
    /// The port is omitted when it is the scheme's default.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Byte stream to the upstream, plain or TLS.
trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Opens one HTTP/1.1 connection to the upstream per forwarded request.
#[derive(Clone)]
pub struct Upstream {
    target: UpstreamTarget,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("target", &self.target)
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Upstream {
    /// Build the connector for a target. `https` targets get a rustls client
    /// trusting the Mozilla root set.
    pub fn new(target: UpstreamTarget, connect_timeout: Duration) -> Result<Self, UpstreamError> {
        let tls = match target.scheme() {
            Scheme::Http => None,
            Scheme::Https => Some(tls_connector()?),
        };
        Ok(Self {
            target,
            tls,
            connect_timeout,
        })
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Connect and perform the HTTP/1.1 handshake.
    ///
    /// The connection driver runs on its own task with upgrades enabled and
    /// ends once the returned sender and any response body are dropped.
    pub async fn handshake(&self) -> Result<SendRequest<Body>, UpstreamError> {
        let io = tokio::time::timeout(self.connect_timeout, self.connect())
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(self.target.authority()))??;

        let (sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(io))
            .await
            .map_err(UpstreamError::Handshake)?;

        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                debug!("Upstream connection closed with error: {}", err);
            }
        });

        Ok(sender)
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamIo>, UpstreamError> {
        let stream = TcpStream::connect((self.target.host(), self.target.port()))
            .await
            .map_err(|source| UpstreamError::Connect {
                authority: self.target.authority(),
                source,
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on upstream socket: {}", err);
        }

        let Some(tls) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let server_name = ServerName::try_from(self.target.host().to_string())
            .map_err(|_| UpstreamError::InvalidServerName(self.target.host().to_string()))?;
        let stream = tls
            .connect(server_name, stream)
            .await
            .map_err(UpstreamError::TlsHandshake)?;
        Ok(Box::new(stream))
    }
}

fn tls_connector() -> Result<TlsConnector, UpstreamError> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_applies_scheme_default_ports() {
        let http = UpstreamTarget::parse("http://app.internal").unwrap();
        assert_eq!(http.scheme(), Scheme::Http);
        assert_eq!(http.host(), "app.internal");
        assert_eq!(http.port(), 80);

        let https = UpstreamTarget::parse("https://app.internal/").unwrap();
        assert_eq!(https.scheme(), Scheme::Https);
        assert_eq!(https.port(), 443);
    }

    #[test]
    fn parse_honours_explicit_port() {
        let target = UpstreamTarget::parse("https://api.internal:8443").unwrap();
        assert_eq!(target.port(), 8443);
        assert_eq!(target.authority(), "api.internal:8443");
        assert_eq!(target.to_string(), "https://api.internal:8443");
    }

    #[test]
    fn authority_omits_default_port() {
        let target = UpstreamTarget::parse("http://app:80").unwrap();
        assert_eq!(target.authority(), "app");
    }

    #[test]
    fn ipv6_hosts_are_bracketed_in_authority_only() {
        let target = UpstreamTarget::parse("http://[::1]:8080").unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.authority(), "[::1]:8080");
    }

    #[test]
    fn parse_rejects_path() {
        let err = UpstreamTarget::parse("https://api.internal:8443/v1").unwrap_err();
        assert!(matches!(err, UpstreamError::UnexpectedComponent("path")));
    }

    #[test]
    fn parse_rejects_query_fragment_and_credentials() {
        assert!(matches!(
            UpstreamTarget::parse("http://app/?a=1").unwrap_err(),
            UpstreamError::UnexpectedComponent("query")
        ));
        assert!(matches!(
            UpstreamTarget::parse("http://app/#top").unwrap_err(),
            UpstreamError::UnexpectedComponent("fragment")
        ));
        assert!(matches!(
            UpstreamTarget::parse("http://user:pw@app").unwrap_err(),
            UpstreamError::UnexpectedComponent("credentials")
        ));
        assert!(matches!(
            UpstreamTarget::parse("http://user@app").unwrap_err(),
            UpstreamError::UnexpectedComponent("credentials")
        ));
    }

    #[test]
    fn parse_rejects_other_schemes_and_garbage() {
        assert!(matches!(
            UpstreamTarget::parse("ftp://app").unwrap_err(),
            UpstreamError::UnsupportedScheme(_)
        ));
        assert!(matches!(
            UpstreamTarget::parse("not a url").unwrap_err(),
            UpstreamError::InvalidUrl(_)
        ));
    }

    #[test]
    fn https_upstream_builds_tls_connector() {
        let target = UpstreamTarget::parse("https://app.internal").unwrap();
        let upstream = Upstream::new(target, DEFAULT_CONNECT_TIMEOUT).unwrap();
        assert!(upstream.tls.is_some());
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = UpstreamTarget::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let upstream = Upstream::new(target, DEFAULT_CONNECT_TIMEOUT).unwrap();
        let err = upstream.handshake().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }));
    }
}
