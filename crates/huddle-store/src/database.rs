//! SQLite-backed [`DocumentStore`].
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. Documents are stored as
//! JSON text in a single `documents` table keyed by collection; filters are
//! evaluated in process after loading a collection in insertion order.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::document::{Document, DocumentStore, Filter, Update, UpdateResult};
use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at an explicit path, creating the parent
    /// directory if needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::init(conn)
    }

    /// Open a private in-memory database. Contents vanish on drop.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Run schema migrations.
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.lock()
            .ok()
            .and_then(|conn| conn.path().map(PathBuf::from))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load every document of a collection with its rowid, in insertion order.
fn load(conn: &Connection, collection: &str) -> Result<Vec<(i64, Document)>> {
    let mut stmt = conn.prepare(
        "SELECT rowid, body
         FROM documents
         WHERE collection = ?1
         ORDER BY rowid ASC",
    )?;

    let rows = stmt.query_map(params![collection], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (rowid, body) = row?;
        docs.push((rowid, serde_json::from_str(&body)?));
    }
    Ok(docs)
}

fn doc_id(doc: &Value) -> Option<i64> {
    doc.get("id").and_then(Value::as_i64)
}

fn write_back(conn: &Connection, rowid: i64, doc: &Document) -> Result<()> {
    conn.execute(
        "UPDATE documents SET doc_id = ?1, body = ?2 WHERE rowid = ?3",
        params![doc_id(doc), serde_json::to_string(doc)?, rowid],
    )?;
    Ok(())
}

impl DocumentStore for Database {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        Ok(load(&conn, collection)?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| filter.matches(doc))
            .collect())
    }

    fn insert_one(&self, collection: &str, doc: Document) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO documents (collection, doc_id, body) VALUES (?1, ?2, ?3)",
            params![collection, doc_id(&doc), serde_json::to_string(&doc)?],
        )?;
        Ok(())
    }

    fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for doc in &docs {
            tx.execute(
                "INSERT INTO documents (collection, doc_id, body) VALUES (?1, ?2, ?3)",
                params![collection, doc_id(doc), serde_json::to_string(doc)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut result = UpdateResult::default();

        if let Some((rowid, mut doc)) = load(&tx, collection)?
            .into_iter()
            .find(|(_, doc)| filter.matches(doc))
        {
            result.matched = 1;
            if update.apply(&mut doc) {
                write_back(&tx, rowid, &doc)?;
                result.modified = 1;
            }
        }

        tx.commit()?;
        Ok(result)
    }

    fn update_many(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut result = UpdateResult::default();

        for (rowid, mut doc) in load(&tx, collection)? {
            if !filter.matches(&doc) {
                continue;
            }
            result.matched += 1;
            if update.apply(&mut doc) {
                write_back(&tx, rowid, &doc)?;
                result.modified += 1;
            }
        }

        tx.commit()?;
        Ok(result)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let conn = self.lock()?;
        let Some((rowid, _)) = load(&conn, collection)?
            .into_iter()
            .find(|(_, doc)| filter.matches(doc))
        else {
            return Ok(0);
        };
        let affected = conn.execute("DELETE FROM documents WHERE rowid = ?1", params![rowid])?;
        Ok(affected as u64)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut affected = 0u64;
        for (rowid, doc) in load(&tx, collection)? {
            if filter.matches(&doc) {
                affected += tx.execute("DELETE FROM documents WHERE rowid = ?1", params![rowid])? as u64;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn max_id(&self, collection: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let max = conn
            .query_row(
                "SELECT MAX(doc_id) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        db.insert_one("users", json!({ "id": 1, "username": "ana" })).unwrap();
        drop(db);

        let reopened = Database::open_at(&path).unwrap();
        let users = reopened.find("users", &Filter::All).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["username"], "ana");
    }

    #[test]
    fn max_id_tracks_updates() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.max_id("groups").unwrap(), None);

        db.insert_one("groups", json!({ "id": 4 })).unwrap();
        db.insert_one("groups", json!({ "id": 9 })).unwrap();
        db.insert_one("users", json!({ "id": 50 })).unwrap();
        assert_eq!(db.max_id("groups").unwrap(), Some(9));

        db.delete_one("groups", &Filter::by_id(9)).unwrap();
        assert_eq!(db.max_id("groups").unwrap(), Some(4));
    }

    #[test]
    fn update_many_persists_each_document() {
        let db = Database::open_in_memory().unwrap();
        db.insert_many(
            "groups",
            vec![
                json!({ "id": 1, "members": [{ "id": 3 }, { "id": 4 }] }),
                json!({ "id": 2, "members": [{ "id": 3 }] }),
                json!({ "id": 3, "members": [] }),
            ],
        )
        .unwrap();

        let result = db
            .update_many(
                "groups",
                &Filter::All,
                &Update::Pull { field: "members".into(), matching: Filter::eq("id", 3) },
            )
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 3, modified: 2 });

        let still_listed = db.find("groups", &Filter::eq("members.id", 3)).unwrap();
        assert!(still_listed.is_empty());
        let g1 = db.find_one("groups", &Filter::by_id(1)).unwrap().unwrap();
        assert_eq!(g1["members"], json!([{ "id": 4 }]));
    }
}
