//! Append-only failure records for jobs.

use rusqlite::{params, Connection, Row};

use super::{Database, DatabaseError};

/// A raw error log row.
#[derive(Debug, Clone)]
pub struct ErrorLogRow {
    pub id: i64,
    pub job_id: String,
    pub message: String,
    pub stack_trace: String,
    pub created_at: String,
}

impl ErrorLogRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            message: row.get("message")?,
            stack_trace: row.get("stack_trace")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts an error log using a bare connection (usable inside a transaction).
pub fn insert_in(
    conn: &Connection,
    job_id: &str,
    message: &str,
    stack_trace: &str,
    created_at: &str,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO error_logs (job_id, message, stack_trace, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![job_id, message, stack_trace, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Returns all error logs for one job, oldest first.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<ErrorLogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM error_logs WHERE job_id = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![job_id], ErrorLogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns the most recent error logs across all jobs, newest first.
pub fn list_recent(db: &Database, limit: u64) -> Result<Vec<ErrorLogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM error_logs ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], ErrorLogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo::{self, JobRow};

    fn db_with_job(id: &str) -> Database {
        let db = Database::open_in_memory().unwrap();
        job_repo::insert(
            &db,
            &JobRow {
                id: id.to_string(),
                owner_ref: "alice".to_string(),
                source_ref: "a.mp3".to_string(),
                status: "transcribing".to_string(),
                transcript_path: None,
                proofread_path: None,
                document_path: None,
                transcribe_prompt_version: None,
                proofread_prompt_version: None,
                created_at: "2026-01-01T00:00:00.000Z".to_string(),
                updated_at: "2026-01-01T00:00:00.000Z".to_string(),
                completed_at: None,
            },
        )
        .unwrap();
        db
    }

    #[test]
    fn test_insert_and_list() {
        let db = db_with_job("j1");
        db.with_conn(|conn| {
            insert_in(conn, "j1", "first", "trace-1", "2026-01-01T00:00:01.000Z")?;
            insert_in(conn, "j1", "second", "trace-2", "2026-01-01T00:00:02.000Z")?;
            Ok(())
        })
        .unwrap();

        let logs = list_for_job(&db, "j1").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].stack_trace, "trace-2");

        let recent = list_recent(&db, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "second");
    }

    #[test]
    fn test_list_for_unknown_job_is_empty() {
        let db = db_with_job("j1");
        assert!(list_for_job(&db, "nope").unwrap().is_empty());
    }
}
