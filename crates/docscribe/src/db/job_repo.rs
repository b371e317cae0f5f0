//! Row-level operations on the `jobs` table.
//!
//! Every status write is a compare-and-set on the current status; callers
//! learn from the returned bool whether their write applied.

use rusqlite::{named_params, params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A `jobs` row as stored: status and timestamps are still strings.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub owner_ref: String,
    pub source_ref: String,
    pub status: String,
    pub transcript_path: Option<String>,
    pub proofread_path: Option<String>,
    pub document_path: Option<String>,
    pub transcribe_prompt_version: Option<i64>,
    pub proofread_prompt_version: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_ref: row.get("owner_ref")?,
            source_ref: row.get("source_ref")?,
            status: row.get("status")?,
            transcript_path: row.get("transcript_path")?,
            proofread_path: row.get("proofread_path")?,
            document_path: row.get("document_path")?,
            transcribe_prompt_version: row.get("transcribe_prompt_version")?,
            proofread_prompt_version: row.get("proofread_prompt_version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub owner_ref: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Artifact columns. Writes go through this list so no caller-supplied
/// string reaches the SQL text.
const ARTIFACT_COLUMNS: &[&str] = &["transcript_path", "proofread_path", "document_path"];

/// Prompt version columns.
const PROMPT_COLUMNS: &[&str] = &["transcribe_prompt_version", "proofread_prompt_version"];

fn checked_column(
    allowed: &[&'static str],
    column: &str,
) -> Result<&'static str, DatabaseError> {
    allowed
        .iter()
        .copied()
        .find(|c| *c == column)
        .ok_or_else(|| DatabaseError::Constraint(format!("unknown column '{}'", column)))
}

pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, owner_ref, source_ref, status, transcript_path,
             proofread_path, document_path, transcribe_prompt_version,
             proofread_prompt_version, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.owner_ref,
                job.source_ref,
                job.status,
                job.transcript_path,
                job.proofread_path,
                job.document_path,
                job.transcribe_prompt_version,
                job.proofread_prompt_version,
                job.created_at,
                job.updated_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Unset filter fields match every row.
const FILTER_CLAUSE: &str = "(:owner IS NULL OR owner_ref = :owner) \
     AND (:status IS NULL OR status = :status)";

/// One page of jobs matching `filter`, newest first, plus the total match count.
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let limit = i64::try_from(filter.limit.unwrap_or(100)).unwrap_or(i64::MAX);
    let offset = i64::try_from(filter.offset.unwrap_or(0)).unwrap_or(i64::MAX);

    db.with_conn(|conn| {
        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs WHERE {}", FILTER_CLAUSE),
            named_params! {
                ":owner": filter.owner_ref,
                ":status": filter.status,
            },
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM jobs WHERE {} ORDER BY created_at DESC, id LIMIT :limit OFFSET :offset",
            FILTER_CLAUSE
        ))?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":owner": filter.owner_ref,
                    ":status": filter.status,
                    ":limit": limit,
                    ":offset": offset,
                },
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Lists jobs whose status is one of `statuses`, oldest first.
pub fn list_by_statuses(db: &Database, statuses: &[&str]) -> Result<Vec<JobRow>, DatabaseError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT * FROM jobs WHERE status IN ({}) ORDER BY created_at ASC, id",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(statuses.iter()), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs whose status is one of `statuses`.
pub fn count_by_statuses(db: &Database, statuses: &[&str]) -> Result<u64, DatabaseError> {
    if statuses.is_empty() {
        return Ok(0);
    }
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM jobs WHERE status IN ({})",
            placeholders.join(", ")
        );
        let count: u64 =
            conn.query_row(&sql, rusqlite::params_from_iter(statuses.iter()), |r| r.get(0))?;
        Ok(count)
    })
}

/// Moves a job from `from` to `to` if it is still at `from`.
///
/// Returns `true` when the row was updated.
pub fn compare_and_set_status(
    db: &Database,
    id: &str,
    from: &str,
    to: &str,
    updated_at: &str,
    completed_at: Option<&str>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, updated_at = ?4,
             completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1 AND status = ?2",
            params![id, from, to, updated_at, completed_at],
        )?;
        Ok(changed == 1)
    })
}

/// Marks a job as failed unless it already reached a status in `terminal`.
///
/// Takes a bare connection so it can run inside a caller's transaction.
pub fn mark_error_in(
    conn: &Connection,
    id: &str,
    error_status: &str,
    terminal: &[&str],
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    let mut values: Vec<&str> = vec![id, error_status, updated_at];
    values.extend_from_slice(terminal);
    let placeholders: Vec<String> = (0..terminal.len()).map(|i| format!("?{}", i + 4)).collect();
    let sql = if placeholders.is_empty() {
        "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1".to_string()
    } else {
        format!(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status NOT IN ({})",
            placeholders.join(", ")
        )
    };
    let changed = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
    Ok(changed == 1)
}

/// Sets an artifact path exactly once, and only while the job is in
/// `required_status`.
///
/// Returns `true` when the row was updated.
pub fn set_artifact_once(
    db: &Database,
    id: &str,
    column: &str,
    path: &str,
    required_status: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    let column = checked_column(ARTIFACT_COLUMNS, column)?;
    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE jobs SET {col} = ?2, updated_at = ?4
             WHERE id = ?1 AND status = ?3 AND {col} IS NULL",
            col = column
        );
        let changed = conn.execute(&sql, params![id, path, required_status, updated_at])?;
        Ok(changed == 1)
    })
}

/// Records the prompt version used by a stage.
pub fn set_prompt_version(
    db: &Database,
    id: &str,
    column: &str,
    version: i64,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    let column = checked_column(PROMPT_COLUMNS, column)?;
    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE jobs SET {} = ?2, updated_at = ?3 WHERE id = ?1",
            column
        );
        let changed = conn.execute(&sql, params![id, version, updated_at])?;
        Ok(changed == 1)
    })
}
