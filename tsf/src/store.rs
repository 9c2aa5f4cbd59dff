//! Per-chunk-table blob fetch: wraps the one prepared statement a
//! `ChunkTable` needs (`SELECT chunk FROM <table> WHERE chunk_id = ?`).

use rusqlite::{Connection, OptionalExtension};
use tsf_base::Result;

pub struct ChunkStore<'conn> {
    conn: &'conn Connection,
    sql: String,
    pub(crate) table_name: String,
}

impl<'conn> ChunkStore<'conn> {
    pub fn new(conn: &'conn Connection, table_name: impl Into<String>, sql: impl Into<String>) -> Self {
        ChunkStore {
            conn,
            sql: sql.into(),
            table_name: table_name.into(),
        }
    }

    /// Fetches the raw (still-compressed) bytes for `chunk_id`, or `None` if
    /// no row exists -- an absent chunk is a hole, not an error.
    pub fn fetch(&self, chunk_id: i64) -> Result<Option<Vec<u8>>> {
        let mut stmt = self.conn.prepare_cached(&self.sql)?;
        let row = stmt
            .query_row([chunk_id], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(row)
    }
}
