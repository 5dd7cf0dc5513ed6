use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CheckKind;

/// Outcome of a single probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Unknown,
    Up,
    Down,
    /// Healthy, but the certificate is about to expire.
    Warn,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Unknown => write!(f, "unknown"),
            Outcome::Up => write!(f, "up"),
            Outcome::Down => write!(f, "down"),
            Outcome::Warn => write!(f, "warn"),
        }
    }
}

impl FromStr for Outcome {
    type Err = std::convert::Infallible;

    /// Unrecognised strings read back as `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "up" => Outcome::Up,
            "down" => Outcome::Down,
            "warn" => Outcome::Warn,
            _ => Outcome::Unknown,
        })
    }
}

/// TLS certificate observation for the probed host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslDetails {
    pub valid: bool,
    pub expiry: Option<DateTime<Utc>>,
}

impl SslDetails {
    pub fn valid_until(expiry: DateTime<Utc>) -> Self {
        Self { valid: true, expiry: Some(expiry) }
    }

    pub fn invalid() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpDetail {
    /// Status code received, absent when the request never got a response.
    pub status_code: Option<u16>,
    pub status_code_valid: bool,
    pub body_valid: bool,
    pub ssl: SslDetails,
}

/// Protocol specific part of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeDetail {
    Http(HttpDetail),
}

impl ProbeDetail {
    /// Detail with nothing observed, for probes that never ran to completion.
    pub fn empty(kind: CheckKind) -> Self {
        match kind {
            CheckKind::Http => ProbeDetail::Http(HttpDetail::default()),
        }
    }
}

/// Result of one probe. Immutable once built; the store only appends these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub monitor_id: Uuid,
    pub outcome: Outcome,
    /// When the probe started
    pub checked_at: DateTime<Utc>,
    /// Time spent on the network call, absent when no response arrived.
    pub latency: Option<Duration>,
    /// Empty on success.
    pub error_message: String,
    pub detail: ProbeDetail,
}

impl CheckResult {
    pub fn new(monitor_id: Uuid, checked_at: DateTime<Utc>, detail: ProbeDetail) -> Self {
        Self {
            monitor_id,
            outcome: Outcome::Unknown,
            checked_at,
            latency: None,
            error_message: String::new(),
            detail,
        }
    }

    pub fn down(mut self, error: impl Into<String>) -> Self {
        self.outcome = Outcome::Down;
        self.error_message = error.into();
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = error.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn http_detail(&self) -> Option<&HttpDetail> {
        match &self.detail {
            ProbeDetail::Http(detail) => Some(detail),
        }
    }
}
