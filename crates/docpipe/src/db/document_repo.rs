//! Document repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::document::{Document, DocumentStatus, NewDocument};

use super::{format_ts, parse_ts, Database, DatabaseError};

const DOCUMENT_COLUMNS: &str = "id, owner_id, title, file_name, file_path, mime_type, size_bytes, \
                                status, page_count, chunk_count, created_at, updated_at";

fn row_to_document(row: &Row<'_>) -> Result<Result<Document, DatabaseError>, rusqlite::Error> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let decoded = status
        .parse::<DocumentStatus>()
        .map_err(|e| DatabaseError::Decode {
            id: id.clone(),
            column: "status",
            reason: e.to_string(),
        })
        .and_then(|status| {
            Ok((
                status,
                parse_ts(&id, "created_at", &created_at)?,
                parse_ts(&id, "updated_at", &updated_at)?,
            ))
        });
    let (status, created_at, updated_at) = match decoded {
        Ok(values) => values,
        Err(e) => return Ok(Err(e)),
    };

    Ok(Ok(Document {
        id,
        owner_id: row.get("owner_id")?,
        title: row.get("title")?,
        file_name: row.get("file_name")?,
        file_path: row.get("file_path")?,
        mime_type: row.get("mime_type")?,
        size_bytes: row.get("size_bytes")?,
        status,
        page_count: row.get("page_count")?,
        chunk_count: row.get("chunk_count")?,
        created_at,
        updated_at,
    }))
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<Document>, DatabaseError> {
    conn.query_row(
        &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
        params![id],
        row_to_document,
    )
    .optional()?
    .transpose()
}

/// Inserts an `uploaded` document. Takes a bare connection so it can join
/// a caller's transaction.
pub fn insert_in(
    conn: &Connection,
    new_doc: &NewDocument,
    now: DateTime<Utc>,
) -> Result<Document, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let ts = format_ts(now);
    conn.execute(
        "INSERT INTO documents (id, owner_id, title, file_name, file_path, mime_type, size_bytes,
         status, page_count, chunk_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'uploaded', 0, 0, ?8, ?8)",
        params![
            id,
            new_doc.owner_id,
            new_doc.title,
            new_doc.file_name,
            new_doc.file_path,
            new_doc.mime_type,
            new_doc.size_bytes,
            ts,
        ],
    )?;
    find_in(conn, &id)?.ok_or(DatabaseError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
}

/// Creates a document in its own statement.
pub fn create(db: &Database, new_doc: &NewDocument, now: DateTime<Utc>) -> Result<Document, DatabaseError> {
    db.with_conn(|conn| insert_in(conn, new_doc, now))
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Document>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// `uploaded -> processing`. A document that already moved on is left
/// alone, so a retried job never walks the status backwards.
pub fn mark_processing(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE documents SET status = 'processing', updated_at = ?2
             WHERE id = ?1 AND status = 'uploaded'",
            params![id, format_ts(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Marks a document `active` and records its page and chunk counts.
/// Takes a bare connection so it can share the chunk-write transaction.
pub fn mark_active_in(
    conn: &Connection,
    id: &str,
    page_count: u32,
    chunk_count: u32,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE documents SET status = 'active', page_count = ?2, chunk_count = ?3, updated_at = ?4
         WHERE id = ?1",
        params![id, page_count, chunk_count, format_ts(now)],
    )?;
    Ok(changed == 1)
}
