//! Versioned prompt bodies, one series per stage.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw prompt row.
#[derive(Debug, Clone)]
pub struct PromptRow {
    pub id: i64,
    pub stage: String,
    pub version: i64,
    pub body: String,
    pub created_at: String,
}

impl PromptRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            stage: row.get("stage")?,
            version: row.get("version")?,
            body: row.get("body")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a prompt as the next version for its stage. Returns the new row.
pub fn insert_next_version(
    db: &Database,
    stage: &str,
    body: &str,
    created_at: &str,
) -> Result<PromptRow, DatabaseError> {
    db.with_transaction(|tx| {
        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM prompts WHERE stage = ?1",
            params![stage],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO prompts (stage, version, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![stage, version, body, created_at],
        )?;
        Ok(PromptRow {
            id: tx.last_insert_rowid(),
            stage: stage.to_string(),
            version,
            body: body.to_string(),
            created_at: created_at.to_string(),
        })
    })
}

/// Finds a prompt by its row ID.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<PromptRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM prompts WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], PromptRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists every prompt for a stage, newest version first.
pub fn list_for_stage(db: &Database, stage: &str) -> Result<Vec<PromptRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM prompts WHERE stage = ?1 ORDER BY version DESC")?;
        let rows = stmt
            .query_map(params![stage], PromptRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
