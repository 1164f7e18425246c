//! v001 -- Initial schema creation.
//!
//! A single `documents` table holds every collection. `doc_id` mirrors the
//! document's numeric `id` field so the next-id scan can use an index.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT    NOT NULL,
    doc_id     INTEGER,              -- copy of body.id, NULL when absent
    body       TEXT    NOT NULL      -- JSON document
);

CREATE INDEX IF NOT EXISTS idx_documents_collection_id
    ON documents(collection, doc_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
