//! Schema versions, recorded in `_migrations`.
//!
//! Each pending migration commits together with its ledger row. Column
//! additions are skipped when the column is already there.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    Standard,
    /// `ALTER TABLE .. ADD COLUMN`, applied only when the column is missing.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// Ordered by version.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_error_logs_table",
        sql: include_str!("sql/002_create_error_logs.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_prompts_and_settings_tables",
        sql: include_str!("sql/003_create_prompts_and_settings.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_leases_table",
        sql: include_str!("sql/004_create_leases.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "add_completed_at_to_jobs",
        sql: include_str!("sql/005_add_completed_at.sql"),
        kind: MigrationKind::AddColumn {
            table: "jobs",
            column: "completed_at",
        },
    },
];

const CREATE_LEDGER: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);";

fn applied_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Applies every migration newer than the ledger's highest version.
///
/// Each migration and its ledger row commit together, so a crash between
/// two migrations leaves the schema at a recorded version.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(CREATE_LEDGER)?;
    let applied = applied_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        let needed = match migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = apply(conn, migration, needed);
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
    }

    Ok(())
}

fn apply(conn: &Connection, migration: &Migration, needed: bool) -> Result<(), DatabaseError> {
    if needed {
        log::info!("Applying migration v{} ({})", migration.version, migration.description);
        conn.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
    } else {
        log::debug!("Migration v{} already reflected in schema", migration.version);
    }

    conn.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            super::format_timestamp(chrono::Utc::now())
        ],
    )?;
    Ok(())
}

/// Whether `table` has a column named `column`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let valid_identifier = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_identifier {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("'{}' is not a plain table name", table),
        });
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    for name in stmt.query_map([], |row| row.get::<_, String>(1))? {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
