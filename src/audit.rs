use chrono::Local;
use rusqlite::Connection;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Bootstrap,
    UserCreated,
    ImportCompleted,
    RowDropped,
    RowUnparseable,
    RecordRejected,
    FlagsChanged,
    ReconciliationRun,
    DivergenceCreated,
    RecordEdited,
    RecordDeleted,
    FileDeleted,
    DivergencesCleared,
    DatabaseReset,
    AccessDenied,
}

impl AuditAction {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Bootstrap => "BOOTSTRAP",
            Self::UserCreated => "USER_CREATED",
            Self::ImportCompleted => "IMPORT_COMPLETED",
            Self::RowDropped => "ROW_DROPPED",
            Self::RowUnparseable => "ROW_UNPARSEABLE",
            Self::RecordRejected => "RECORD_REJECTED",
            Self::FlagsChanged => "FLAGS_CHANGED",
            Self::ReconciliationRun => "RECONCILIATION_RUN",
            Self::DivergenceCreated => "DIVERGENCE_CREATED",
            Self::RecordEdited => "RECORD_EDITED",
            Self::RecordDeleted => "RECORD_DELETED",
            Self::FileDeleted => "FILE_DELETED",
            Self::DivergencesCleared => "DIVERGENCES_CLEARED",
            Self::DatabaseReset => "DATABASE_RESET",
            Self::AccessDenied => "ACCESS_DENIED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub actor: String,
    pub action: AuditAction,
    pub timestamp: String,
    pub affected_entity: String,
    pub details: String,
}

impl AuditLogEntry {
    pub fn now(actor: &str, action: AuditAction, entity: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            actor: actor.to_string(),
            action,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            affected_entity: entity.into(),
            details: details.into(),
        }
    }
}

/// Receiver of audit entries. Pipeline stages emit into a buffer that is
/// flushed inside the same transaction as the data it describes.
pub trait AuditSink {
    fn emit(&mut self, entry: AuditLogEntry);
}

impl AuditSink for Vec<AuditLogEntry> {
    fn emit(&mut self, entry: AuditLogEntry) {
        self.push(entry);
    }
}

pub fn persist(conn: &Connection, entries: &[AuditLogEntry]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO audit_log (actor, action, timestamp, affected_entity, details) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for e in entries {
        stmt.execute(rusqlite::params![
            e.actor,
            e.action.code(),
            e.timestamp,
            e.affected_entity,
            e.details
        ])?;
    }
    Ok(())
}

/// Write a single entry right away, outside any batch.
pub fn record(conn: &Connection, entry: AuditLogEntry) -> Result<()> {
    persist(conn, std::slice::from_ref(&entry))
}

pub struct AuditRow {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub timestamp: String,
    pub affected_entity: String,
    pub details: String,
}

pub fn list(conn: &Connection, action: Option<&str>, limit: usize) -> Result<Vec<AuditRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor, action, timestamp, affected_entity, details FROM audit_log \
         WHERE (?1 IS NULL OR action = ?1) ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![action, limit as i64], |row| {
            Ok(AuditRow {
                id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                timestamp: row.get(3)?,
                affected_entity: row.get(4)?,
                details: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count(conn: &Connection, action: AuditAction) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT count(*) FROM audit_log WHERE action = ?1",
        [action.code()],
        |r| r.get(0),
    )?)
}
