//! Key/value system settings.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// Reads a setting.
pub fn get(db: &Database, key: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let value = conn
            .query_row(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    })
}

/// Writes a setting unconditionally.
pub fn set(db: &Database, key: &str, value: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO system_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    })
}

/// Writes `new` only if the setting currently holds `expected`.
///
/// Returns `true` when the write applied.
pub fn compare_and_set(
    db: &Database,
    key: &str,
    expected: &str,
    new: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE system_settings SET value = ?3 WHERE key = ?1 AND value = ?2",
            params![key, expected, new],
        )?;
        Ok(changed == 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let db = Database::open_in_memory().unwrap();
        assert!(get(&db, "missing").unwrap().is_none());
        set(&db, "k", "1").unwrap();
        set(&db, "k", "2").unwrap();
        assert_eq!(get(&db, "k").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_compare_and_set() {
        let db = Database::open_in_memory().unwrap();
        assert!(compare_and_set(&db, "resource_running", "false", "true").unwrap());
        assert!(!compare_and_set(&db, "resource_running", "false", "true").unwrap());
        assert_eq!(
            get(&db, "resource_running").unwrap().as_deref(),
            Some("true")
        );
    }
}
