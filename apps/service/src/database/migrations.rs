use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
///
/// This is the single source of truth for the database schema.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!(version = current_version, "Database schema is up to date");
        return Ok(());
    }

    tracing::info!(from = current_version, to = SCHEMA_VERSION, "Running migrations");

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Monitors and check results").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Track when a monitor lock was claimed").await?;
    }

    tracing::info!(version = SCHEMA_VERSION, "Database migrations completed");
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: monitors and the append-only check history.
///
/// Structured fields (headers, accepted codes, probe detail) are JSON text.
/// `check_results` deliberately has no foreign key: history outlives the
/// monitor it belongs to.
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS monitors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            address TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'GET',
            headers TEXT NOT NULL DEFAULT '{}',
            body TEXT NOT NULL DEFAULT '',
            content_type TEXT NOT NULL DEFAULT '',
            accepted_status_codes TEXT NOT NULL DEFAULT '[200]',
            expected_body TEXT,
            check_ssl INTEGER NOT NULL DEFAULT 0,
            warn_on_ssl_expiry INTEGER NOT NULL DEFAULT 0,
            request_timeout_ms INTEGER NOT NULL DEFAULT 30000,
            interval_ms INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            in_flight INTEGER NOT NULL DEFAULT 0,
            last_run_at INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS check_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            monitor_uuid TEXT NOT NULL,
            kind TEXT NOT NULL,
            checked_at INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            latency_ms INTEGER,
            error_message TEXT NOT NULL DEFAULT '',
            detail TEXT NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_monitors_due ON monitors(enabled, in_flight, last_run_at)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_monitors_kind ON monitors(kind)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_check_results_monitor_checked ON check_results(monitor_uuid, checked_at DESC)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_check_results_outcome ON check_results(outcome)", ()).await?;

    Ok(())
}

/// Migration v2: remember when the in-flight flag was set so an optional
/// lease can recover monitors left locked by a crashed process.
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE monitors ADD COLUMN claimed_at INTEGER", ()).await?;

    tracing::info!("Added claimed_at column to monitors table");
    Ok(())
}
