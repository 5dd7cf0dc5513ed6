//! Row mapping between the flat `monitors`/`check_results` columns and the
//! domain types. JSON (de)serialization of structured fields happens here and
//! nowhere else.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Row, Value};
use uuid::Uuid;

use super::StoreError;
use crate::models::{CheckKind, CheckResult, HttpMonitor, Monitor, MonitorKind, Outcome, ProbeDetail};

/// Column list shared by every monitor SELECT, in [`monitor_from_row`] order.
pub const MONITOR_COLUMNS: &str = "uuid, name, kind, address, method, headers, body, content_type, \
     accepted_status_codes, expected_body, check_ssl, warn_on_ssl_expiry, request_timeout_ms, \
     interval_ms, enabled, in_flight, last_run_at";

pub const RESULT_COLUMNS: &str =
    "monitor_uuid, checked_at, outcome, latency_ms, error_message, detail";

pub fn millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn duration_from_millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or_default())
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("bad uuid {raw:?}: {e}")))
}

fn flag(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

/// Flattened monitor, ready to be bound to an INSERT.
pub struct MonitorRecord {
    pub uuid: String,
    pub name: String,
    pub kind: &'static str,
    pub address: String,
    pub method: String,
    pub headers: String,
    pub body: String,
    pub content_type: String,
    pub accepted_status_codes: String,
    pub expected_body: Option<String>,
    pub check_ssl: i64,
    pub warn_on_ssl_expiry: i64,
    pub request_timeout_ms: i64,
    pub interval_ms: i64,
    pub enabled: i64,
    pub in_flight: i64,
    pub last_run_at: i64,
}

impl MonitorRecord {
    /// Flatten a monitor, re-applying the request timeout clamp on the way in.
    pub fn from_monitor(monitor: &Monitor) -> Result<Self, StoreError> {
        let mut monitor = monitor.clone();
        monitor.normalize();

        let MonitorKind::Http(http) = &monitor.kind;

        Ok(Self {
            uuid: monitor.id.to_string(),
            name: monitor.name.clone(),
            kind: monitor.kind().as_str(),
            address: http.address.clone(),
            method: http.method.clone(),
            headers: serde_json::to_string(&http.headers)?,
            body: http.body.clone(),
            content_type: http.content_type.clone(),
            accepted_status_codes: serde_json::to_string(&http.accepted_status_codes)?,
            expected_body: http.expected_body.clone(),
            check_ssl: flag(http.check_ssl),
            warn_on_ssl_expiry: flag(http.warn_on_ssl_expiry),
            request_timeout_ms: duration_millis(http.request_timeout),
            interval_ms: duration_millis(monitor.interval),
            enabled: flag(monitor.enabled),
            in_flight: flag(monitor.in_flight),
            last_run_at: millis(monitor.last_run_at),
        })
    }

    pub fn into_params(self, now: i64) -> Vec<Value> {
        vec![
            self.uuid.into(),
            self.name.into(),
            self.kind.into(),
            self.address.into(),
            self.method.into(),
            self.headers.into(),
            self.body.into(),
            self.content_type.into(),
            self.accepted_status_codes.into(),
            self.expected_body.into(),
            self.check_ssl.into(),
            self.warn_on_ssl_expiry.into(),
            self.request_timeout_ms.into(),
            self.interval_ms.into(),
            self.enabled.into(),
            self.in_flight.into(),
            self.last_run_at.into(),
            now.into(),
            now.into(),
        ]
    }
}

/// Rebuild a monitor from a row selected with [`MONITOR_COLUMNS`].
///
/// Unknown kinds surface as [`StoreError::UnknownKind`].
pub fn monitor_from_row(row: &Row) -> Result<Monitor, StoreError> {
    let uuid = parse_uuid(&row.get::<String>(0)?)?;
    let kind: CheckKind = row.get::<String>(2)?.parse()?;

    let kind = match kind {
        CheckKind::Http => {
            let headers: BTreeMap<String, String> = serde_json::from_str(&row.get::<String>(5)?)?;
            let accepted_status_codes: Vec<u16> = serde_json::from_str(&row.get::<String>(8)?)?;

            let mut http = HttpMonitor {
                address: row.get(3)?,
                method: row.get(4)?,
                headers,
                body: row.get(6)?,
                content_type: row.get(7)?,
                accepted_status_codes,
                expected_body: row.get::<Option<String>>(9)?,
                check_ssl: row.get::<i64>(10)? != 0,
                warn_on_ssl_expiry: row.get::<i64>(11)? != 0,
                request_timeout: duration_from_millis(row.get::<i64>(12)?),
            };
            http.normalize();
            MonitorKind::Http(http)
        }
    };

    Ok(Monitor {
        id: uuid,
        name: row.get(1)?,
        kind,
        interval: duration_from_millis(row.get::<i64>(13)?),
        enabled: row.get::<i64>(14)? != 0,
        in_flight: row.get::<i64>(15)? != 0,
        last_run_at: from_millis(row.get::<i64>(16)?)?,
    })
}

/// Flattened check result.
pub fn result_params(result: &CheckResult) -> Result<Vec<Value>, StoreError> {
    let kind = match &result.detail {
        ProbeDetail::Http(_) => CheckKind::Http,
    };

    Ok(vec![
        result.monitor_id.to_string().into(),
        kind.as_str().into(),
        millis(result.checked_at).into(),
        result.outcome.to_string().into(),
        result.latency.map(duration_millis).into(),
        result.error_message.clone().into(),
        serde_json::to_string(&result.detail)?.into(),
    ])
}

/// Rebuild a result from a row selected with [`RESULT_COLUMNS`].
pub fn result_from_row(row: &Row) -> Result<CheckResult, StoreError> {
    let outcome: Outcome = row.get::<String>(2)?.parse().unwrap_or_default();

    Ok(CheckResult {
        monitor_id: parse_uuid(&row.get::<String>(0)?)?,
        outcome,
        checked_at: from_millis(row.get::<i64>(1)?)?,
        latency: row.get::<Option<i64>>(3)?.map(duration_from_millis),
        error_message: row.get(4)?,
        detail: serde_json::from_str(&row.get::<String>(5)?)?,
    })
}
