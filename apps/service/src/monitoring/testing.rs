//! In-memory store, scripted checkers and a local TLS server for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checker::{Checker, PROBE_CANCELLED};
use super::lock::LockCoordinator;
use crate::database::{ClaimError, MonitorStore, StoreError};
use crate::models::{CheckKind, CheckResult, HttpMonitor, Monitor, Outcome, ProbeDetail};

#[derive(Default)]
struct State {
    monitors: Vec<Monitor>,
    results: Vec<CheckResult>,
    releases: HashMap<Uuid, usize>,
    list_calls: usize,
    fail_list: bool,
    fail_save: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn with_monitors(monitors: impl IntoIterator<Item = Monitor>) -> Arc<Self> {
        let store = Self::default();
        store.state.lock().unwrap().monitors = monitors.into_iter().collect();
        Arc::new(store)
    }

    /// Enabled HTTP monitor, 60s interval, last run two minutes ago.
    pub fn due_monitor() -> Monitor {
        let mut monitor =
            Monitor::http("memory", HttpMonitor::new("http://127.0.0.1:9"), Duration::from_secs(60));
        monitor.last_run_at = Utc::now() - chrono::Duration::seconds(120);
        monitor
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().monitors.iter().map(|m| m.id).collect()
    }

    pub fn monitor(&self, id: Uuid) -> Monitor {
        let state = self.state.lock().unwrap();
        state.monitors.iter().find(|m| m.id == id).cloned().expect("monitor exists")
    }

    pub fn set_in_flight(&self, id: Uuid, in_flight: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(monitor) = state.monitors.iter_mut().find(|m| m.id == id) {
            monitor.in_flight = in_flight;
        }
    }

    pub fn results(&self) -> Vec<CheckResult> {
        self.state.lock().unwrap().results.clone()
    }

    pub fn release_count(&self, id: Uuid) -> usize {
        self.state.lock().unwrap().releases.get(&id).copied().unwrap_or(0)
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    pub fn fail_save(&self, fail: bool) {
        self.state.lock().unwrap().fail_save = fail;
    }
}

fn injected() -> StoreError {
    StoreError::Corrupt("injected failure".to_string())
}

#[async_trait]
impl LockCoordinator for MemoryStore {
    async fn claim(&self, id: Uuid) -> Result<(), ClaimError> {
        let mut state = self.state.lock().unwrap();
        let monitor = state.monitors.iter_mut().find(|m| m.id == id).ok_or(ClaimError::NotFound)?;
        if monitor.in_flight {
            return Err(ClaimError::AlreadyLocked);
        }
        let due = chrono::Duration::from_std(monitor.interval)
            .is_ok_and(|interval| monitor.last_run_at + interval <= Utc::now());
        if !due {
            return Err(ClaimError::NotDue);
        }
        monitor.in_flight = true;
        Ok(())
    }

    async fn release(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(monitor) = state.monitors.iter_mut().find(|m| m.id == id) {
            monitor.in_flight = false;
            monitor.last_run_at = at;
        }
        *state.releases.entry(id).or_default() += 1;
        Ok(())
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        if state.fail_list {
            return Err(injected());
        }
        Ok(state.monitors.iter().filter(|m| m.is_due(now)).cloned().collect())
    }

    async fn save_result(&self, result: &CheckResult) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_save {
            return Err(injected());
        }
        state.results.push(result.clone());
        Ok(())
    }

    async fn save_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.monitors.retain(|m| m.id != monitor.id);
        state.monitors.push(monitor.clone());
        Ok(())
    }

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>, StoreError> {
        Ok(self.state.lock().unwrap().monitors.iter().find(|m| m.id == id).cloned())
    }

    async fn delete_monitor(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let before = state.monitors.len();
        state.monitors.retain(|m| m.id != id);
        Ok(state.monitors.len() != before)
    }

    async fn enabled_monitors_by_kind(&self, kind: CheckKind) -> Result<Vec<Monitor>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.monitors.iter().filter(|m| m.enabled && m.kind() == kind).cloned().collect())
    }

    async fn recent_results(&self, id: Uuid, limit: usize) -> Result<Vec<CheckResult>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.results.iter().rev().filter(|r| r.monitor_id == id).take(limit).cloned().collect())
    }
}

/// Checker that sleeps, records concurrency and answers `Up`.
#[derive(Default)]
pub struct ScriptedChecker {
    delay: Duration,
    /// Panic instead of answering for this monitor
    panic_for: Option<Uuid>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedChecker {
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, ..Default::default() })
    }

    pub fn panicking_for(id: Uuid) -> Arc<Self> {
        Arc::new(Self { panic_for: Some(id), ..Default::default() })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Checker for ScriptedChecker {
    async fn check(&self, monitor: &Monitor, cancel: CancellationToken) -> CheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let result = CheckResult::new(monitor.id, Utc::now(), ProbeDetail::empty(monitor.kind()));
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.delay) => false,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.panic_for == Some(monitor.id) {
            panic!("scripted failure");
        }

        if cancelled {
            result.down(PROBE_CANCELLED)
        } else {
            result.with_latency(self.delay).with_outcome(Outcome::Up)
        }
    }
}

/// Self-signed certificate for `127.0.0.1`.
pub struct SelfSigned {
    der: CertificateDer<'static>,
    key: Vec<u8>,
    /// Expiry date (year, month, day), midnight UTC
    pub not_after: (i32, u8, u8),
}

impl SelfSigned {
    pub fn expiring_in_days(days: i64) -> Self {
        let expiry = Utc::now() + chrono::Duration::days(days);
        let not_after = (expiry.year(), expiry.month() as u8, expiry.day() as u8);

        let mut params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        Self { der: cert.der().clone(), key: key.serialize_der(), not_after }
    }

    /// Root store trusting only this certificate.
    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.der.clone()).unwrap();
        roots
    }

    fn acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone()));
        let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![self.der.clone()], key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Serve one canned HTTPS response per connection. Returns the `https://` address.
pub async fn serve_tls(cert: &SelfSigned, status: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("https://{}", listener.local_addr().unwrap());
    let acceptor = cert.acceptor();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                // Certificate inspections hang up right after the handshake.
                let Ok(mut stream) = acceptor.accept(socket).await else {
                    return;
                };

                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                }

                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    address
}
