//! Version-tracked schema migrations for the libSQL backend.
//!
//! Applied versions are recorded in `_migrations`; anything listed in
//! [`MIGRATIONS`] but missing there is applied on open.

use std::collections::HashSet;

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Schema history. Append only; never edit an applied entry.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                owner_id INTEGER NOT NULL,
                label TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                source_ids TEXT NOT NULL DEFAULT '[]',
                destination_ids TEXT NOT NULL DEFAULT '[]',
                filters TEXT NOT NULL DEFAULT '{}',
                modifications TEXT NOT NULL DEFAULT '{}',
                delay_secs INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (owner_id, label)
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS task_stats (
                label TEXT PRIMARY KEY,
                delivered INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
    Migration {
        version: 2,
        name: "stats_per_owner",
        // Labels are unique per owner only. Counters whose label is shared
        // by several owners cannot be attributed and are dropped.
        sql: r#"
            CREATE TABLE task_stats_by_owner (
                owner_id INTEGER NOT NULL,
                label TEXT NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (owner_id, label)
            );

            INSERT INTO task_stats_by_owner (owner_id, label, delivered, failed, updated_at)
                SELECT t.owner_id, s.label, s.delivered, s.failed, s.updated_at
                FROM task_stats s JOIN tasks t ON t.label = s.label
                WHERE s.label IN (SELECT label FROM tasks GROUP BY label HAVING COUNT(*) = 1);

            DROP TABLE task_stats;
            ALTER TABLE task_stats_by_owner RENAME TO task_stats;
        "#,
    },
];

/// Bring the schema up to date.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    apply(conn, MIGRATIONS).await
}

/// Apply every migration in `migrations` that has not been recorded yet.
///
/// Each migration runs in its own transaction together with its
/// `_migrations` row, so a failed step leaves neither behind.
async fn apply(conn: &Connection, migrations: &[Migration]) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("bootstrap: {e}")))?;

    let applied = applied_versions(conn).await?;
    let mut pending = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .peekable();
    if pending.peek().is_none() {
        tracing::debug!("Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // The failed statement leaves the transaction open.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} {}: {e}",
                migration.version, migration.name
            )));
        }
    }
    Ok(())
}

/// Versions already recorded in `_migrations`.
async fn applied_versions(conn: &Connection) -> Result<HashSet<i64>, DatabaseError> {
    let mut rows = conn
        .query("SELECT version FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read versions: {e}")))?;

    let mut versions = HashSet::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read versions: {e}")))?
    {
        let version = row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("bad version row: {e}")))?;
        versions.insert(version);
    }
    Ok(versions)
}
