//! Extracted text cache, one row per document.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::document::ExtractedText;

use super::{format_ts, parse_ts, Database, DatabaseError};

/// Version tag written with every extraction.
pub const EXTRACTION_VERSION: &str = "v1";

/// Stores the extracted text for a document, replacing any earlier
/// extraction while keeping its original `created_at`.
pub fn upsert(
    db: &Database,
    document_id: &str,
    text: &str,
    page_count: u32,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let ts = format_ts(now);
        conn.execute(
            "INSERT INTO extracted_texts (document_id, text, page_count, extraction_version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(document_id) DO UPDATE SET
                 text = excluded.text,
                 page_count = excluded.page_count,
                 extraction_version = excluded.extraction_version,
                 updated_at = excluded.updated_at",
            params![document_id, text, page_count, EXTRACTION_VERSION, ts],
        )?;
        Ok(())
    })
}

pub fn find_by_document(db: &Database, document_id: &str) -> Result<Option<ExtractedText>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT document_id, text, page_count, extraction_version, created_at, updated_at
                 FROM extracted_texts WHERE document_id = ?1",
                params![document_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, u32>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(document_id, text, page_count, extraction_version, created, updated)| {
            Ok(ExtractedText {
                created_at: parse_ts(&document_id, "created_at", &created)?,
                updated_at: parse_ts(&document_id, "updated_at", &updated)?,
                document_id,
                text,
                page_count,
                extraction_version,
            })
        })
        .transpose()
    })
}
