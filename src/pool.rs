//! Pooled clients for upstream dispatch
//!
//! Three long-lived clients cover the upstream matrix: plain HTTP,
//! verified HTTPS, and HTTPS with peer verification disabled. hyper's
//! legacy client pools per endpoint internally and drains idle
//! connections on its own, so endpoints that disappear from the
//! configuration simply age out. Upstreams with an SNI override bypass
//! the pool with a one-shot TLS connection.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::snapshot::UpstreamScheme;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error type for upstream dispatch
#[derive(Debug)]
pub enum PoolError {
    /// Error from the pooled HTTP client
    Client(hyper_util::client::legacy::Error),
    /// TCP or TLS connection establishment failure
    Connect(String),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::Connect(s) => write!(f, "Connect error: {}", s),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Configuration for the upstream pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per endpoint
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Data-path deadlines
    pub timeouts: Timeouts,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            timeouts: Timeouts::default(),
        }
    }
}

/// Pooled upstream clients
pub struct UpstreamPool {
    http: Client<HttpConnector, ProxyBody>,
    https: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    https_insecure: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    tls_verified: TlsConnector,
    tls_insecure: TlsConnector,
    config: PoolConfig,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(config.timeouts.connect));
        connector.enforce_http(false);

        let http = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let verified_tls = verified_client_config();
        let insecure_tls = insecure_client_config();

        let https = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(
                hyper_rustls::HttpsConnectorBuilder::new()
                    .with_tls_config(verified_tls.clone())
                    .https_or_http()
                    .enable_http1()
                    .build(),
            );

        let https_insecure = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(
                hyper_rustls::HttpsConnectorBuilder::new()
                    .with_tls_config(insecure_tls.clone())
                    .https_or_http()
                    .enable_http1()
                    .build(),
            );

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool configured"
        );

        Self {
            http,
            https,
            https_insecure,
            tls_verified: TlsConnector::from(Arc::new(verified_tls)),
            tls_insecure: TlsConnector::from(Arc::new(insecure_tls)),
            config,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.config.timeouts
    }

    /// Dispatch a request to `endpoint` ("host:port").
    ///
    /// `sni_override` forces a specific TLS server name; those requests
    /// use a dedicated connection instead of the shared pool.
    pub async fn send(
        &self,
        req: Request<ProxyBody>,
        scheme: UpstreamScheme,
        verify_ssl: bool,
        sni_override: Option<&str>,
    ) -> Result<Response<Incoming>, PoolError> {
        match (scheme, sni_override) {
            (UpstreamScheme::Http, _) => Ok(self.http.request(req).await?),
            (UpstreamScheme::Https, None) => {
                let client = if verify_ssl {
                    &self.https
                } else {
                    &self.https_insecure
                };
                Ok(client.request(req).await?)
            }
            (UpstreamScheme::Https, Some(sni)) => {
                self.send_with_sni(req, verify_ssl, sni).await
            }
        }
    }

    /// One-shot TLS connection with an explicit SNI name
    async fn send_with_sni(
        &self,
        req: Request<ProxyBody>,
        verify_ssl: bool,
        sni: &str,
    ) -> Result<Response<Incoming>, PoolError> {
        let authority = req
            .uri()
            .authority()
            .ok_or_else(|| PoolError::RequestBuild("missing authority".to_string()))?
            .to_string();

        let tcp = tokio::time::timeout(
            self.config.timeouts.connect,
            TcpStream::connect(&authority),
        )
        .await
        .map_err(|_| PoolError::Connect(format!("connect timeout to {}", authority)))?
        .map_err(|e| PoolError::Connect(format!("connect to {}: {}", authority, e)))?;

        let server_name = ServerName::try_from(sni.to_string())
            .map_err(|e| PoolError::Connect(format!("invalid SNI name {}: {}", sni, e)))?;

        let connector = if verify_ssl {
            &self.tls_verified
        } else {
            &self.tls_insecure
        };
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| PoolError::Connect(format!("TLS to {}: {}", authority, e)))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| PoolError::Connect(format!("HTTP handshake: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "SNI-override upstream connection closed");
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(|e| PoolError::Connect(format!("upstream request: {}", e)))
    }
}

fn verified_client_config() -> rustls::ClientConfig {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        if roots.add(cert).is_err() {
            warn!("Skipping unloadable native root certificate");
        }
    }

    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn insecure_client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoVerifier));
    config
}

/// Verifier used when an upstream has `verify_ssl` disabled
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.timeouts.connect, Duration::from_secs(10));
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::Connect("refused".to_string());
        assert_eq!(err.to_string(), "Connect error: refused");

        let err = PoolError::RequestBuild("bad uri".to_string());
        assert!(err.to_string().contains("bad uri"));
    }
}
