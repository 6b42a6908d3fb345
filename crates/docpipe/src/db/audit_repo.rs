//! Audit log table.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::audit::{AuditEvent, AuditRecord};

use super::{format_ts, parse_ts, Database, DatabaseError};

/// Appends one audit entry and returns its ID.
pub fn insert(db: &Database, event: &AuditEvent, now: DateTime<Utc>) -> Result<String, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO audit_logs (id, user_id, action, resource_type, resource_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                event.actor_id,
                event.action,
                event.resource_type,
                event.resource_id,
                event.metadata.to_string(),
                format_ts(now),
            ],
        )?;
        Ok(())
    })?;
    Ok(id)
}

/// Audit entries for one resource, oldest first.
pub fn list_for_resource(
    db: &Database,
    resource_type: &str,
    resource_id: &str,
) -> Result<Vec<AuditRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, action, resource_type, resource_id, metadata, created_at
             FROM audit_logs WHERE resource_type = ?1 AND resource_id = ?2
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![resource_type, resource_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, actor_id, action, resource_type, resource_id, metadata, created)| {
                let metadata = serde_json::from_str(&metadata).map_err(|e| DatabaseError::Decode {
                    id: id.clone(),
                    column: "metadata",
                    reason: e.to_string(),
                })?;
                Ok(AuditRecord {
                    created_at: parse_ts(&id, "created_at", &created)?,
                    id,
                    actor_id,
                    action,
                    resource_type,
                    resource_id,
                    metadata,
                })
            })
            .collect()
    })
}
