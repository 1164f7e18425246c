//! Schema upgrades for the SQLite document store.
//!
//! [`Database::open_at`](crate::Database::open_at) and
//! [`Database::open_in_memory`](crate::Database::open_in_memory) call
//! [`run_migrations`] before handing out the connection. The schema version
//! lives in `PRAGMA user_version`; steps at or below it are skipped.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered by version. Append a step here when the `documents` layout changes.
const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

fn target_version() -> u32 {
    STEPS.last().map_or(0, |(version, _, _)| *version)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    tracing::debug!(current, target = target_version(), "document schema version");

    for (version, name, up) in STEPS.iter().filter(|(version, _, _)| *version > current) {
        tracing::info!(version, name, "upgrading document schema");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(conn: &Connection) -> u32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0)).unwrap()
    }

    #[test]
    fn upgrades_once_and_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(version(&conn), target_version());

        conn.execute(
            "INSERT INTO documents (collection, doc_id, body) VALUES ('groups', 1, '{\"id\":1}')",
            [],
        )
        .unwrap();
        run_migrations(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(version(&conn), target_version());
    }
}
