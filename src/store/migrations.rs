//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS accounts (
            address TEXT PRIMARY KEY,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cursors (
            account TEXT PRIMARY KEY,
            marker TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processing_records (
            message_id TEXT PRIMARY KEY,
            account TEXT NOT NULL,
            category TEXT NOT NULL,
            outcome TEXT NOT NULL,
            importance TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_processing_category
            ON processing_records(category);

        CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT COLLATE NOCASE PRIMARY KEY,
            customer_email TEXT NOT NULL,
            amount TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'completed',
            refund_status TEXT,
            refund_requested_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS refund_requests (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            requested_order_id TEXT,
            outcome TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_refund_requests_outcome
            ON refund_requests(outcome);
        CREATE INDEX IF NOT EXISTS idx_refund_requests_message
            ON refund_requests(message_id);

        CREATE TABLE IF NOT EXISTS not_found_attempts (
            id TEXT PRIMARY KEY,
            customer_email TEXT NOT NULL,
            invalid_order_id TEXT NOT NULL,
            last_body TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (customer_email, invalid_order_id)
        );

        CREATE TABLE IF NOT EXISTS unhandled (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            importance TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_unhandled_importance
            ON unhandled(importance);
    "#,
}];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        _ => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_apply_cleanly() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }
}
