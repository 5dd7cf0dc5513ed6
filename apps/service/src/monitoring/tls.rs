//! Leaf certificate inspection for HTTP monitors.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustls::pki_types::{InvalidDnsNameError, ServerName};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

use crate::models::SslDetails;

const DEFAULT_TLS_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum TlsCheckError {
    #[error("invalid address: {0}")]
    Address(#[from] url::ParseError),

    #[error("address has no host")]
    MissingHost,

    #[error("invalid server name: {0}")]
    ServerName(#[from] InvalidDnsNameError),

    #[error("tls connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer sent no certificate")]
    NoCertificate,

    #[error("unreadable certificate: {0}")]
    Certificate(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Reads the leaf certificate expiry of a monitored host.
#[derive(Clone)]
pub struct CertificateInspector {
    config: Arc<ClientConfig>,
}

impl CertificateInspector {
    /// Trust the platform root certificates.
    pub fn new() -> Result<Self, rustls::Error> {
        Ok(Self { config: native_client_config()? })
    }

    /// Trust only `roots`.
    pub fn with_roots(roots: RootCertStore) -> Result<Self, rustls::Error> {
        Ok(Self { config: Arc::new(client_config(roots)?) })
    }

    /// Open a verified TLS connection to the monitor's host and report the
    /// leaf certificate's expiry.
    ///
    /// Never fails: any error is logged and reported as an invalid certificate.
    pub async fn inspect(&self, address: &str, timeout: Duration) -> SslDetails {
        let outcome = match tokio::time::timeout(timeout, self.leaf_expiry(address)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TlsCheckError::Timeout(timeout)),
        };

        match outcome {
            Ok(expiry) => SslDetails::valid_until(expiry),
            Err(e) => {
                warn!(address, error = %e, "certificate inspection failed");
                SslDetails::invalid()
            }
        }
    }

    async fn leaf_expiry(&self, address: &str) -> Result<DateTime<Utc>, TlsCheckError> {
        let (host, port) = tls_target(address)?;
        let server_name = ServerName::try_from(host.clone())?;
        let connector = TlsConnector::from(Arc::clone(&self.config));

        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let tls = connector.connect(server_name, stream).await?;

        let (_, session) = tls.get_ref();
        let leaf = session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or(TlsCheckError::NoCertificate)?;

        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| TlsCheckError::Certificate(e.to_string()))?;
        let not_after = cert.validity().not_after.timestamp();

        DateTime::from_timestamp(not_after, 0)
            .ok_or_else(|| TlsCheckError::Certificate(format!("expiry out of range: {not_after}")))
    }
}

/// Host and port to dial. The port defaults to 443 whatever the scheme.
pub fn tls_target(address: &str) -> Result<(String, u16), TlsCheckError> {
    let url = Url::parse(address)?;
    let host = url.host_str().ok_or(TlsCheckError::MissingHost)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_TLS_PORT)))
}

/// Loading platform roots is slow, so the config is built once per process.
fn native_client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }

    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        debug!(%error, "skipping unreadable platform certificate");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "loaded platform root certificates");

    let config = Arc::new(client_config(roots)?);
    Ok(Arc::clone(CONFIG.get_or_init(|| config)))
}

fn client_config(roots: RootCertStore) -> Result<ClientConfig, rustls::Error> {
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}
