use std::error::Error as _;
use std::time::Instant;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Request};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::tls::CertificateInspector;
use crate::models::{CheckResult, HttpDetail, HttpMonitor, Monitor, MonitorKind, Outcome, ProbeDetail, SslDetails};

/// Certificates expiring within this many days turn an `Up` into a `Warn`.
pub const SSL_EXPIRY_WARNING_DAYS: i64 = 30;

/// Message recorded when the run is cancelled while a probe is in flight.
pub const PROBE_CANCELLED: &str = "probe cancelled";

/// Failure to set up a checker's HTTP client or TLS configuration
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to build tls configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Checker trait for monitor probes
///
/// A checker never fails: transport and validation problems are reported as
/// a `Down` result.
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, monitor: &Monitor, cancel: CancellationToken) -> CheckResult;
}

/// Dispatches a monitor to the checker for its kind
pub struct ProbeRunner {
    http: HttpChecker,
}

impl ProbeRunner {
    pub fn new() -> Result<Self, CheckerError> {
        Ok(Self { http: HttpChecker::new()? })
    }
}

#[async_trait::async_trait]
impl Checker for ProbeRunner {
    async fn check(&self, monitor: &Monitor, cancel: CancellationToken) -> CheckResult {
        match &monitor.kind {
            MonitorKind::Http(http) => self.http.probe(monitor.id, http, cancel).await,
        }
    }
}

/// HTTP checker
pub struct HttpChecker {
    client: reqwest::Client,
    certificates: CertificateInspector,
}

impl HttpChecker {
    /// Client with the shraga user agent, certificates checked against the
    /// platform roots.
    pub fn new() -> Result<Self, CheckerError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shraga/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_parts(client, CertificateInspector::new()?))
    }

    pub fn with_parts(client: reqwest::Client, certificates: CertificateInspector) -> Self {
        Self { client, certificates }
    }

    /// Run one HTTP probe.
    ///
    /// Order matters: request construction errors end the probe before any
    /// network activity, the certificate is inspected before the request,
    /// and the body is only read once the status code has been accepted.
    pub async fn probe(&self, monitor_id: Uuid, http: &HttpMonitor, cancel: CancellationToken) -> CheckResult {
        let checked_at = Utc::now();
        let mut detail = HttpDetail::default();
        let result = |detail: &HttpDetail| {
            CheckResult::new(monitor_id, checked_at, ProbeDetail::Http(detail.clone()))
        };

        let request = match self.build_request(http) {
            Ok(request) => request,
            Err(e) => return result(&detail).down(e),
        };

        if http.should_inspect_certificate() {
            detail.ssl = tokio::select! {
                ssl = self.certificates.inspect(&http.address, http.request_timeout) => ssl,
                _ = cancel.cancelled() => SslDetails::invalid(),
            };
        }

        let start = Instant::now();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return result(&detail).down(PROBE_CANCELLED),
            response = self.client.execute(request) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return result(&detail).down(error_chain(&e)),
        };
        let latency = start.elapsed();

        let status = response.status().as_u16();
        detail.status_code = Some(status);
        detail.status_code_valid = http.accepted_status_codes.contains(&status);
        if !detail.status_code_valid {
            return result(&detail)
                .with_latency(latency)
                .down(format!("unexpected status code: {status}"));
        }

        if let Some(expected) = &http.expected_body {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return result(&detail).with_latency(latency).down(PROBE_CANCELLED)
                }
                body = response.bytes() => body,
            };
            let body = match body {
                Ok(body) => body,
                Err(e) => return result(&detail).with_latency(latency).down(error_chain(&e)),
            };

            // Raw bytes, no charset decoding.
            if body.as_ref() != expected.as_bytes() {
                return result(&detail)
                    .with_latency(latency)
                    .down(format!("response is not as expected: {}", String::from_utf8_lossy(&body)));
            }
            detail.body_valid = true;
        }

        let outcome = decide_outcome(&detail.ssl, http.warn_on_ssl_expiry, Utc::now());
        debug!(monitor_id = %monitor_id, status, latency_ms = latency.as_millis() as u64, %outcome, "http probe finished");

        result(&detail).with_latency(latency).with_outcome(outcome)
    }

    fn build_request(&self, http: &HttpMonitor) -> Result<Request, String> {
        let url = Url::parse(&http.address).map_err(|e| e.to_string())?;
        let method = if http.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(http.method.as_bytes()).map_err(|e| e.to_string())?
        };

        let mut headers = HeaderMap::new();
        if !http.body.is_empty() && !http.content_type.is_empty() {
            let value = HeaderValue::from_str(&http.content_type).map_err(|e| e.to_string())?;
            headers.insert(CONTENT_TYPE, value);
        }
        for (name, value) in &http.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?;
            let value = HeaderValue::from_str(value).map_err(|e| e.to_string())?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(http.request_timeout);
        if !http.body.is_empty() {
            builder = builder.body(http.body.clone());
        }

        builder.build().map_err(|e| error_chain(&e))
    }
}

/// Final outcome of a probe whose transport, status and body checks passed.
pub fn decide_outcome(ssl: &SslDetails, warn_on_expiry: bool, now: DateTime<Utc>) -> Outcome {
    match ssl.expiry {
        Some(expiry)
            if warn_on_expiry
                && ssl.valid
                && expiry - now < chrono::Duration::days(SSL_EXPIRY_WARNING_DAYS) =>
        {
            Outcome::Warn
        }
        _ => Outcome::Up,
    }
}

/// reqwest hides the interesting part (refused, dns, timeout) in the source chain.
fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
