use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use tracing::warn;
use uuid::Uuid;

use super::models::{
    MONITOR_COLUMNS, MonitorRecord, RESULT_COLUMNS, millis, monitor_from_row, result_from_row,
    result_params,
};
use super::{ClaimError, StoreError};
use crate::models::{CheckKind, CheckResult, Monitor};
use crate::monitoring::lock::LockCoordinator;
use crate::pool::{LibsqlManager, LibsqlPool};

/// Store operations consumed by the scheduler, plus the administrative ones
/// used to manage monitor definitions.
#[async_trait]
pub trait MonitorStore: LockCoordinator {
    /// Monitors with `enabled && !in_flight && last_run_at + interval <= now`
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError>;

    /// Append a result to the history
    async fn save_result(&self, result: &CheckResult) -> Result<(), StoreError>;

    /// Insert or update a monitor definition. Lock state and last run time of
    /// an existing monitor are left untouched.
    async fn save_monitor(&self, monitor: &Monitor) -> Result<(), StoreError>;

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>, StoreError>;

    /// Returns whether a monitor was deleted. Its results are kept.
    async fn delete_monitor(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn enabled_monitors_by_kind(&self, kind: CheckKind) -> Result<Vec<Monitor>, StoreError>;

    /// Most recent results first
    async fn recent_results(&self, id: Uuid, limit: usize) -> Result<Vec<CheckResult>, StoreError>;
}

/// LibSQL backed store
pub struct LibsqlStore {
    pool: LibsqlPool,
    lock_lease: Option<Duration>,
}

impl LibsqlStore {
    pub fn new(pool: LibsqlPool) -> Self {
        Self { pool, lock_lease: None }
    }

    /// Treat locks older than `lease` as abandoned.
    ///
    /// Without a lease a process crash in the middle of a probe leaves the
    /// monitor locked until someone clears `in_flight` by hand.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = Some(lease);
        self
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>, StoreError> {
        Ok(self.pool.get().await?)
    }

    fn lease_ms(&self) -> Option<i64> {
        self.lock_lease.map(|lease| i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
    }

    async fn query_monitors(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Monitor>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query(sql, params).await?;
        let mut monitors = Vec::new();

        while let Some(row) = rows.next().await? {
            monitors.push(monitor_from_row(&row)?);
        }

        Ok(monitors)
    }
}

#[async_trait]
impl LockCoordinator for LibsqlStore {
    async fn claim(&self, id: Uuid) -> Result<(), ClaimError> {
        let conn = self.get_conn().await.map_err(ClaimError::Store)?;
        let now = millis(Utc::now());

        // Single conditional update; a separate read-then-write would race
        // with other workers or scheduler processes. The due check rejects a
        // listing that went stale while it waited for a worker.
        let affected = conn
            .execute(
                "UPDATE monitors SET in_flight = 1, claimed_at = ?2
                 WHERE uuid = ?1
                   AND last_run_at + interval_ms <= ?2
                   AND (in_flight = 0 OR (?3 IS NOT NULL AND claimed_at IS NOT NULL AND claimed_at <= ?2 - ?3))",
                params![id.to_string(), now, self.lease_ms()],
            )
            .await
            .map_err(StoreError::from)?;

        if affected > 0 {
            return Ok(());
        }

        let mut rows = conn
            .query(
                "SELECT in_flight, last_run_at + interval_ms <= ?2 FROM monitors WHERE uuid = ?1",
                params![id.to_string(), now],
            )
            .await
            .map_err(StoreError::from)?;

        let Some(row) = rows.next().await.map_err(StoreError::from)? else {
            return Err(ClaimError::NotFound);
        };
        let in_flight = row.get::<i64>(0).map_err(StoreError::from)? != 0;
        let due = row.get::<i64>(1).map_err(StoreError::from)? != 0;

        if in_flight || due { Err(ClaimError::AlreadyLocked) } else { Err(ClaimError::NotDue) }
    }

    async fn release(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;

        conn.execute(
            "UPDATE monitors SET in_flight = 0, claimed_at = NULL, last_run_at = ?2 WHERE uuid = ?1",
            params![id.to_string(), millis(at)],
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MonitorStore for LibsqlStore {
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError> {
        let sql = format!(
            "SELECT {MONITOR_COLUMNS} FROM monitors
             WHERE enabled = 1
               AND (in_flight = 0 OR (?2 IS NOT NULL AND claimed_at IS NOT NULL AND claimed_at <= ?1 - ?2))
               AND last_run_at + interval_ms <= ?1
             ORDER BY last_run_at ASC"
        );

        let conn = self.get_conn().await?;
        let mut rows = conn.query(&sql, params![millis(now), self.lease_ms()]).await?;
        let mut monitors = Vec::new();

        // A row that fails to decode only takes itself out of the schedule.
        while let Some(row) = rows.next().await? {
            match monitor_from_row(&row) {
                Ok(mut monitor) => {
                    // A lease-expired lock is stale; hand the monitor out as unlocked.
                    monitor.in_flight = false;
                    monitors.push(monitor);
                }
                Err(e) => {
                    let monitor_id = row.get::<String>(0).unwrap_or_default();
                    warn!(%monitor_id, error = %e, "skipping undecodable monitor");
                }
            }
        }

        Ok(monitors)
    }

    async fn save_result(&self, result: &CheckResult) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;

        conn.execute(
            "INSERT INTO check_results
                (monitor_uuid, kind, checked_at, outcome, latency_ms, error_message, detail)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            result_params(result)?,
        )
        .await?;

        Ok(())
    }

    async fn save_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        let record = MonitorRecord::from_monitor(monitor)?;

        conn.execute(
            &format!(
                "INSERT INTO monitors ({MONITOR_COLUMNS}, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(uuid) DO UPDATE SET
                    name = excluded.name,
                    kind = excluded.kind,
                    address = excluded.address,
                    method = excluded.method,
                    headers = excluded.headers,
                    body = excluded.body,
                    content_type = excluded.content_type,
                    accepted_status_codes = excluded.accepted_status_codes,
                    expected_body = excluded.expected_body,
                    check_ssl = excluded.check_ssl,
                    warn_on_ssl_expiry = excluded.warn_on_ssl_expiry,
                    request_timeout_ms = excluded.request_timeout_ms,
                    interval_ms = excluded.interval_ms,
                    enabled = excluded.enabled,
                    updated_at = excluded.updated_at"
            ),
            record.into_params(millis(Utc::now())),
        )
        .await?;

        Ok(())
    }

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>, StoreError> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE uuid = ?1");
        Ok(self.query_monitors(&sql, params![id.to_string()]).await?.into_iter().next())
    }

    async fn delete_monitor(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.get_conn().await?;
        let affected =
            conn.execute("DELETE FROM monitors WHERE uuid = ?1", params![id.to_string()]).await?;
        Ok(affected > 0)
    }

    async fn enabled_monitors_by_kind(&self, kind: CheckKind) -> Result<Vec<Monitor>, StoreError> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE enabled = 1 AND kind = ?1");
        self.query_monitors(&sql, params![kind.as_str()]).await
    }

    async fn recent_results(&self, id: Uuid, limit: usize) -> Result<Vec<CheckResult>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RESULT_COLUMNS} FROM check_results
                     WHERE monitor_uuid = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2"
                ),
                params![id.to_string(), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(result_from_row(&row)?);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::initialize_database;
    use crate::models::{HttpDetail, HttpMonitor, MonitorKind, Outcome, ProbeDetail, SslDetails};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    /// Helper to create a migrated store in a temporary directory
    async fn create_test_store() -> anyhow::Result<(LibsqlStore, TempDir)> {
        let temp_dir = tempdir()?;
        let pool = crate::pool::open_local(temp_dir.path().join("test.db"), 16).await?;

        let conn = pool.get().await?;
        initialize_database(&conn).await?;
        drop(conn);

        Ok((LibsqlStore::new(pool), temp_dir))
    }

    fn http_monitor(interval_secs: u64) -> Monitor {
        let mut http = HttpMonitor::new("https://example.com/health");
        http.headers.insert("Authorization".to_string(), "Bearer token".to_string());
        http.accepted_status_codes = vec![200, 301];
        Monitor::http("example", http, Duration::from_secs(interval_secs))
    }

    #[tokio::test]
    async fn test_save_and_get_monitor() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let monitor = http_monitor(60);

        store.save_monitor(&monitor).await?;
        let loaded = store.get_monitor(monitor.id).await?.expect("monitor exists");

        assert_eq!(loaded, monitor);
        assert!(store.get_monitor(Uuid::new_v4()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_request_timeout_is_clamped_on_write() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;

        for (configured, stored) in [(0, 30), (900, 300), (10, 10)] {
            let mut monitor = http_monitor(60);
            let MonitorKind::Http(http) = &mut monitor.kind;
            http.request_timeout = Duration::from_secs(configured);

            store.save_monitor(&monitor).await?;
            let loaded = store.get_monitor(monitor.id).await?.expect("monitor exists");
            let MonitorKind::Http(http) = &loaded.kind;
            assert_eq!(http.request_timeout, Duration::from_secs(stored));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_list_due() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let now = Utc::now();

        let mut due = http_monitor(60);
        due.last_run_at = now - chrono::Duration::seconds(120);

        let mut recent = http_monitor(60);
        recent.last_run_at = now - chrono::Duration::seconds(10);

        let mut disabled = http_monitor(60);
        disabled.enabled = false;

        let mut locked = http_monitor(60);
        locked.in_flight = true;

        for monitor in [&due, &recent, &disabled, &locked] {
            store.save_monitor(monitor).await?;
        }

        let listed: Vec<Uuid> = store.list_due(now).await?.into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec![due.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_and_release() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let monitor = http_monitor(60);
        store.save_monitor(&monitor).await?;

        store.claim(monitor.id).await?;
        assert!(matches!(store.claim(monitor.id).await, Err(ClaimError::AlreadyLocked)));
        assert!(matches!(store.claim(Uuid::new_v4()).await, Err(ClaimError::NotFound)));
        assert!(store.list_due(Utc::now()).await?.is_empty());

        let released_at = Utc::now();
        store.release(monitor.id, released_at).await?;
        // Releasing twice is fine.
        store.release(monitor.id, released_at).await?;
        store.release(Uuid::new_v4(), released_at).await?;

        let loaded = store.get_monitor(monitor.id).await?.expect("monitor exists");
        assert!(!loaded.in_flight);
        assert_eq!(loaded.last_run_at.timestamp_millis(), released_at.timestamp_millis());

        // Just ran, so the next claim waits for the interval.
        assert!(matches!(store.claim(monitor.id).await, Err(ClaimError::NotDue)));
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_listing_cannot_claim_again() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let mut monitor = http_monitor(60);
        monitor.last_run_at = Utc::now() - chrono::Duration::seconds(120);
        store.save_monitor(&monitor).await?;

        let listed = store.list_due(Utc::now()).await?;
        assert_eq!(listed.len(), 1);

        // Another dispatch of the same monitor runs to completion first.
        store.claim(monitor.id).await?;
        store.release(monitor.id, Utc::now()).await?;

        assert!(matches!(store.claim(listed[0].id).await, Err(ClaimError::NotDue)));
        let loaded = store.get_monitor(monitor.id).await?.expect("monitor exists");
        assert!(!loaded.in_flight);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let store = Arc::new(store);
        let monitor = http_monitor(60);
        store.save_monitor(&monitor).await?;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim(monitor.id).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await?.is_ok() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_lease_recovers_stale_claim() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let monitor = http_monitor(60);
        store.save_monitor(&monitor).await?;
        store.claim(monitor.id).await?;

        let store = store.with_lock_lease(Duration::ZERO);
        let due = store.list_due(Utc::now()).await?;
        assert_eq!(due.len(), 1);
        assert!(!due[0].in_flight);

        store.claim(monitor.id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_edit_keeps_lock_state() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let mut monitor = http_monitor(60);
        store.save_monitor(&monitor).await?;
        store.claim(monitor.id).await?;

        monitor.name = "renamed".to_string();
        store.save_monitor(&monitor).await?;

        let loaded = store.get_monitor(monitor.id).await?.expect("monitor exists");
        assert_eq!(loaded.name, "renamed");
        assert!(loaded.in_flight);
        Ok(())
    }

    #[tokio::test]
    async fn test_results_outlive_monitor() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let monitor = http_monitor(60);
        store.save_monitor(&monitor).await?;

        let expiry = Utc::now() + chrono::Duration::days(10);
        let detail = HttpDetail {
            status_code: Some(200),
            status_code_valid: true,
            body_valid: true,
            ssl: SslDetails::valid_until(expiry),
        };
        let result = CheckResult::new(monitor.id, Utc::now(), ProbeDetail::Http(detail))
            .with_latency(Duration::from_millis(42))
            .with_outcome(Outcome::Warn);
        store.save_result(&result).await?;

        assert!(store.delete_monitor(monitor.id).await?);
        assert!(!store.delete_monitor(monitor.id).await?);

        let results = store.recent_results(monitor.id, 10).await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Warn);
        assert_eq!(results[0].latency, Some(Duration::from_millis(42)));
        let ssl = results[0].http_detail().expect("http detail").ssl;
        assert_eq!(ssl.expiry.map(|e| e.timestamp()), Some(expiry.timestamp()));
        Ok(())
    }

    #[tokio::test]
    async fn test_enabled_monitors_by_kind() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let enabled = http_monitor(60);
        let mut disabled = http_monitor(60);
        disabled.enabled = false;
        store.save_monitor(&enabled).await?;
        store.save_monitor(&disabled).await?;

        let monitors = store.enabled_monitors_by_kind(CheckKind::Http).await?;
        assert_eq!(monitors.len(), 1);
        assert_eq!(monitors[0].id, enabled.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_kind_is_reported() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let id = Uuid::new_v4();

        let conn = store.get_conn().await?;
        conn.execute(
            "INSERT INTO monitors (uuid, name, kind, address, interval_ms, created_at, updated_at)
             VALUES (?1, 'legacy', 'gopher', 'gopher://example.com', 60000, 0, 0)",
            params![id.to_string()],
        )
        .await?;
        drop(conn);

        assert!(matches!(store.get_monitor(id).await, Err(StoreError::UnknownKind(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_undecodable_rows_do_not_block_list_due() -> anyhow::Result<()> {
        let (store, _dir) = create_test_store().await?;
        let now = Utc::now();

        let mut healthy = http_monitor(60);
        healthy.last_run_at = now - chrono::Duration::seconds(120);
        store.save_monitor(&healthy).await?;

        let conn = store.get_conn().await?;
        conn.execute(
            "INSERT INTO monitors (uuid, name, kind, address, interval_ms, created_at, updated_at)
             VALUES (?1, 'legacy', 'gopher', 'gopher://example.com', 60000, 0, 0)",
            params![Uuid::new_v4().to_string()],
        )
        .await?;
        conn.execute(
            "INSERT INTO monitors (uuid, name, kind, address, headers, interval_ms, created_at, updated_at)
             VALUES (?1, 'broken', 'http', 'https://example.com', 'not json', 60000, 0, 0)",
            params![Uuid::new_v4().to_string()],
        )
        .await?;
        drop(conn);

        let listed: Vec<Uuid> = store.list_due(now).await?.into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec![healthy.id]);
        Ok(())
    }
}
