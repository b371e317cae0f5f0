//! Named leases with a holder and an expiry.
//!
//! A lease is free when it has no holder or its expiry has passed. Expired
//! leases are taken over by the next acquirer, which is how a crashed
//! holder's slot gets reclaimed.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// Current state of a lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRow {
    pub name: String,
    pub holder: Option<String>,
    pub expires_at: Option<String>,
}

/// Takes the lease for `holder` if it is free, expired, or already held by
/// `holder`. Returns `true` on success.
pub fn try_acquire(
    db: &Database,
    name: &str,
    holder: &str,
    now: &str,
    expires_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO leases (name, holder, expires_at) VALUES (?1, NULL, NULL)",
            params![name],
        )?;
        let changed = conn.execute(
            "UPDATE leases SET holder = ?2, expires_at = ?4
             WHERE name = ?1
               AND (holder IS NULL OR holder = ?2 OR expires_at IS NULL OR expires_at < ?3)",
            params![name, holder, now, expires_at],
        )?;
        Ok(changed == 1)
    })
}

/// Extends the lease if `holder` still holds it. Returns `false` if it was lost.
pub fn renew(
    db: &Database,
    name: &str,
    holder: &str,
    expires_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE leases SET expires_at = ?3 WHERE name = ?1 AND holder = ?2",
            params![name, holder, expires_at],
        )?;
        Ok(changed == 1)
    })
}

/// Frees the lease if `holder` holds it.
pub fn release(db: &Database, name: &str, holder: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE leases SET holder = NULL, expires_at = NULL WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(changed == 1)
    })
}

/// Reads the current lease state.
pub fn get(db: &Database, name: &str) -> Result<Option<LeaseRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT name, holder, expires_at FROM leases WHERE name = ?1",
                params![name],
                |r| {
                    Ok(LeaseRow {
                        name: r.get(0)?,
                        holder: r.get(1)?,
                        expires_at: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOT: &str = "inference_slot";

    #[test]
    fn test_exclusive_acquire() {
        let db = Database::open_in_memory().unwrap();
        let now = "2026-01-01T00:00:00.000Z";
        let exp = "2026-01-01T00:01:00.000Z";

        assert!(try_acquire(&db, SLOT, "a", now, exp).unwrap());
        assert!(!try_acquire(&db, SLOT, "b", now, exp).unwrap());
        // Re-entrant for the same holder.
        assert!(try_acquire(&db, SLOT, "a", now, exp).unwrap());

        assert!(release(&db, SLOT, "a").unwrap());
        assert!(try_acquire(&db, SLOT, "b", now, exp).unwrap());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let db = Database::open_in_memory().unwrap();
        assert!(try_acquire(
            &db,
            SLOT,
            "crashed",
            "2026-01-01T00:00:00.000Z",
            "2026-01-01T00:01:00.000Z"
        )
        .unwrap());
        assert!(try_acquire(
            &db,
            SLOT,
            "next",
            "2026-01-01T00:02:00.000Z",
            "2026-01-01T00:03:00.000Z"
        )
        .unwrap());

        let row = get(&db, SLOT).unwrap().unwrap();
        assert_eq!(row.holder.as_deref(), Some("next"));
        // The previous holder cannot renew or release.
        assert!(!renew(&db, SLOT, "crashed", "2026-01-01T00:09:00.000Z").unwrap());
        assert!(!release(&db, SLOT, "crashed").unwrap());
    }

    #[test]
    fn test_unknown_lease_is_created_on_acquire() {
        let db = Database::open_in_memory().unwrap();
        assert!(try_acquire(&db, "other", "a", "t0", "t1").unwrap());
        assert!(get(&db, "other").unwrap().is_some());
    }
}
