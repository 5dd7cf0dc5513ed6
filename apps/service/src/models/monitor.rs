use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Normalize a configured request timeout.
///
/// Unset (or zero) falls back to [`DEFAULT_REQUEST_TIMEOUT`], anything else is
/// clamped into `[MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT]`.
pub fn clamp_request_timeout(timeout: Option<Duration>) -> Duration {
    match timeout {
        None => DEFAULT_REQUEST_TIMEOUT,
        Some(t) if t.is_zero() => DEFAULT_REQUEST_TIMEOUT,
        Some(t) => t.clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT),
    }
}

/// Protocol a monitor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
}

#[derive(Debug, Error)]
#[error("unknown monitor kind: {0:?}")]
pub struct UnknownKind(pub String);

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Http => "http",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(CheckKind::Http),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// HTTP probe parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMonitor {
    pub address: String,
    /// Request method. Empty means `GET`.
    pub method: String,
    /// Custom headers, each one overriding any default of the same name.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Sent as `Content-Type`, only when `body` is not empty.
    pub content_type: String,
    /// Status codes considered healthy. An empty list never matches.
    pub accepted_status_codes: Vec<u16>,
    /// When set, the full response body must equal this string.
    pub expected_body: Option<String>,
    pub check_ssl: bool,
    pub warn_on_ssl_expiry: bool,
    pub request_timeout: Duration,
}

impl HttpMonitor {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
            content_type: String::new(),
            accepted_status_codes: vec![200],
            expected_body: None,
            check_ssl: false,
            warn_on_ssl_expiry: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn should_inspect_certificate(&self) -> bool {
        self.check_ssl || self.warn_on_ssl_expiry
    }

    /// Re-apply the timeout invariant. Called on every write and read at the
    /// store boundary.
    pub fn normalize(&mut self) {
        self.request_timeout = clamp_request_timeout(Some(self.request_timeout));
    }
}

/// Protocol specific part of a monitor.
///
/// New protocols add a variant here and a checker for it; the scheduler and
/// worker pool only ever see [`Monitor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MonitorKind {
    Http(HttpMonitor),
}

impl MonitorKind {
    pub fn kind(&self) -> CheckKind {
        match self {
            MonitorKind::Http(_) => CheckKind::Http,
        }
    }

    fn normalize(&mut self) {
        match self {
            MonitorKind::Http(http) => http.normalize(),
        }
    }
}

/// A configured, recurring health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,
    pub name: String,
    pub kind: MonitorKind,
    pub interval: Duration,
    pub enabled: bool,
    /// Lock flag, owned by the store. Only a successful claim sets it.
    pub in_flight: bool,
    pub last_run_at: DateTime<Utc>,
}

impl Monitor {
    /// Create an enabled monitor that is due immediately.
    pub fn new(name: impl Into<String>, kind: MonitorKind, interval: Duration) -> Self {
        let mut kind = kind;
        kind.normalize();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            interval,
            enabled: true,
            in_flight: false,
            last_run_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn http(name: impl Into<String>, http: HttpMonitor, interval: Duration) -> Self {
        Self::new(name, MonitorKind::Http(http), interval)
    }

    pub fn kind(&self) -> CheckKind {
        self.kind.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `enabled && !in_flight && now >= last_run_at + interval`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled || self.in_flight {
            return false;
        }
        match chrono::Duration::from_std(self.interval) {
            Ok(interval) => self
                .last_run_at
                .checked_add_signed(interval)
                .is_some_and(|next| now >= next),
            Err(_) => false,
        }
    }

    pub fn normalize(&mut self) {
        self.kind.normalize();
    }
}
