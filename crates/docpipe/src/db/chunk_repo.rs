//! Document chunk persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::chunking::TextChunk;
use crate::document::StoredChunk;

use super::{format_ts, Database, DatabaseError};

/// Replaces every chunk of a document with `chunks`, indexed from zero in
/// order. Delete and insert share the caller's transaction, so readers see
/// either the old set or the new one.
pub fn replace_in(
    conn: &Connection,
    document_id: &str,
    chunks: &[TextChunk],
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    conn.execute(
        "DELETE FROM document_chunks WHERE document_id = ?1",
        params![document_id],
    )?;

    let ts = format_ts(now);
    let mut stmt = conn.prepare(
        "INSERT INTO document_chunks (id, document_id, chunk_index, text, token_count,
         embedding_status, embedding_model, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', NULL, ?6)",
    )?;
    for (index, chunk) in chunks.iter().enumerate() {
        stmt.execute(params![
            uuid::Uuid::new_v4().to_string(),
            document_id,
            index as u32,
            chunk.text,
            chunk.token_count,
            ts,
        ])?;
    }

    Ok(chunks.len())
}

/// Chunks of a document in index order.
pub fn list_for_document(db: &Database, document_id: &str) -> Result<Vec<StoredChunk>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, document_id, chunk_index, text, token_count, embedding_status
             FROM document_chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let chunks = stmt
            .query_map(params![document_id], |r| {
                Ok(StoredChunk {
                    id: r.get(0)?,
                    document_id: r.get(1)?,
                    chunk_index: r.get(2)?,
                    text: r.get(3)?,
                    token_count: r.get(4)?,
                    embedding_status: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    })
}

pub fn count_for_document(db: &Database, document_id: &str) -> Result<u32, DatabaseError> {
    db.with_conn(|conn| {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM document_chunks WHERE document_id = ?1",
            params![document_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
