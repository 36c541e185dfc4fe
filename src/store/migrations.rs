//! Version-tracked schema migrations for the vacation store.
//!
//! `run_migrations()` reads the highest applied version from `_migrations`
//! and applies the newer steps in order, one transaction per step.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "vacation_table",
        sql: r#"
            CREATE TABLE IF NOT EXISTS vacation (
                email TEXT PRIMARY KEY,
                subject TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                activefrom TEXT NOT NULL DEFAULT '2000-01-01 00:00:00',
                activeuntil TEXT NOT NULL DEFAULT '2038-01-18 00:00:00',
                created TEXT NOT NULL DEFAULT (datetime('now')),
                modified TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
    Migration {
        version: 2,
        name: "vacation_active_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_vacation_active
                ON vacation(active, activefrom, activeuntil);
        "#,
    },
];

/// Apply every migration newer than the database's current version.
///
/// Each step and its `_migrations` row commit together, so a failed step
/// leaves the database at the previous version.
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

    let current = current_version(conn).await?;
    let latest = MIGRATIONS.last().map_or(0, |m| m.version);
    if current > latest {
        tracing::warn!(current, latest, "Vacation store schema is newer than this build");
        return Ok(());
    }

    let pending = MIGRATIONS.iter().filter(|m| m.version > current);
    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await?;
    }

    tracing::debug!(version = latest, "Vacation store schema up to date");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: libsql::Error| {
        DatabaseError::Migration(format!(
            "Migration V{} ({}) failed: {e}",
            migration.version, migration.name
        ))
    };

    let tx = conn.transaction().await.map_err(failed)?;
    tx.execute_batch(migration.sql).await.map_err(failed)?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(failed)?;
    tx.commit().await.map_err(failed)
}

/// Highest applied migration version, or 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!(
            "Failed to read migration version: {e}"
        ))),
    }
}
