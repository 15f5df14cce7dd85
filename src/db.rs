use std::path::Path;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::audit::{self, AuditAction, AuditLogEntry};
use crate::error::{MalhaError, Result};
use crate::models::{Competence, FlagSet, PaymentRecord};

pub const DB_FILE: &str = "malha.db";

pub const DEFAULT_ADMIN: &str = "admin";

const INITIALIZED_MARKER: &str = "initialized_at";

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    import_date TEXT DEFAULT (datetime('now')),
    imported_by TEXT NOT NULL,
    record_count INTEGER NOT NULL,
    dropped_count INTEGER NOT NULL DEFAULT 0,
    rejected_count INTEGER NOT NULL DEFAULT 0,
    checksum TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (
    id INTEGER PRIMARY KEY,
    import_id INTEGER NOT NULL,
    cpf TEXT NOT NULL,
    cpf_original TEXT NOT NULL,
    card_number TEXT NOT NULL,
    name TEXT NOT NULL,
    amount TEXT NOT NULL,
    competence_month INTEGER NOT NULL,
    competence_year INTEGER NOT NULL,
    project TEXT,
    source_file TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    flags TEXT NOT NULL DEFAULT '',
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (import_id) REFERENCES imports(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_payments_cpf ON payments(cpf);
CREATE INDEX IF NOT EXISTS idx_payments_card ON payments(card_number);
CREATE INDEX IF NOT EXISTS idx_payments_competence ON payments(competence_year, competence_month);

CREATE TABLE IF NOT EXISTS rejected_rows (
    id INTEGER PRIMARY KEY,
    import_id INTEGER NOT NULL,
    line INTEGER NOT NULL,
    competence_month INTEGER NOT NULL,
    competence_year INTEGER NOT NULL,
    cpf_original TEXT NOT NULL,
    cpf TEXT NOT NULL,
    card_number TEXT NOT NULL,
    name TEXT NOT NULL,
    reasons TEXT NOT NULL,
    FOREIGN KEY (import_id) REFERENCES imports(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS reconciliation_runs (
    id INTEGER PRIMARY KEY,
    competence_month INTEGER NOT NULL,
    competence_year INTEGER NOT NULL,
    bank_file TEXT NOT NULL,
    status TEXT NOT NULL,
    matched INTEGER NOT NULL DEFAULT 0,
    parse_errors INTEGER NOT NULL DEFAULT 0,
    cause TEXT,
    run_by TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS divergences (
    id INTEGER PRIMARY KEY,
    run_id INTEGER NOT NULL,
    cpf TEXT NOT NULL,
    system_name TEXT,
    bank_name TEXT,
    divergence_type TEXT NOT NULL,
    detail TEXT NOT NULL DEFAULT '',
    FOREIGN KEY (run_id) REFERENCES reconciliation_runs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    affected_entity TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT ''
);
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// One-time setup: schema plus the default admin account. Guarded by a
/// persisted marker so running it again changes nothing.
/// Returns true when this call performed the bootstrap.
pub fn bootstrap(conn: &Connection) -> Result<bool> {
    init_db(conn)?;
    if get_metadata(conn, INITIALIZED_MARKER).is_some() {
        return Ok(false);
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT OR IGNORE INTO users (name, role) VALUES (?1, 'admin')",
        [DEFAULT_ADMIN],
    )?;
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    set_metadata(&tx, INITIALIZED_MARKER, &stamp)?;
    audit::record(
        &tx,
        AuditLogEntry::now("system", AuditAction::Bootstrap, "database", format!("default user '{DEFAULT_ADMIN}' created")),
    )?;
    tx.commit()?;
    tracing::info!(user = DEFAULT_ADMIN, "database bootstrapped");
    Ok(true)
}

pub fn is_initialized(conn: &Connection) -> bool {
    get_metadata(conn, INITIALIZED_MARKER).is_some()
}

pub fn get_metadata(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |r| r.get(0))
        .optional()
        .ok()
        .flatten()
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Copy the live database to `dest` with SQLite's online backup.
pub fn backup_to(conn: &Connection, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut dest_conn = Connection::open(dest)?;
    let backup = rusqlite::backup::Backup::new(conn, &mut dest_conn)?;
    backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
    drop(backup);
    Ok(std::fs::metadata(dest)?.len())
}

// ---------------------------------------------------------------------------
// Payment records
// ---------------------------------------------------------------------------

const PAYMENT_COLUMNS: &str = "id, cpf, cpf_original, card_number, name, amount, competence_month, \
     competence_year, project, source_file, row_index, flags";

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let amount: String = row.get(5)?;
    let amount = Decimal::from_str(&amount).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let flags: String = row.get(11)?;
    let row_index: i64 = row.get(10)?;
    Ok(PaymentRecord {
        id: Some(row.get(0)?),
        cpf: row.get(1)?,
        cpf_original: row.get(2)?,
        card_number: row.get(3)?,
        name: row.get(4)?,
        amount,
        competence: Competence {
            month: row.get(6)?,
            year: row.get(7)?,
        },
        project: row.get(8)?,
        source_file: row.get(9)?,
        row_index: row_index as usize,
        flags: FlagSet::from_codes(&flags),
    })
}

/// All stored payments, oldest competence first.
pub fn load_payments(conn: &Connection) -> Result<Vec<PaymentRecord>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments ORDER BY competence_year, competence_month, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], payment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_payments_for(conn: &Connection, competence: Competence) -> Result<Vec<PaymentRecord>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments \
         WHERE competence_month = ?1 AND competence_year = ?2 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params![competence.month, competence.year], payment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_payment(conn: &Connection, id: i64) -> Result<PaymentRecord> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1");
    conn.query_row(&sql, [id], payment_from_row)
        .optional()?
        .ok_or_else(|| MalhaError::NotFound(format!("payment {id}")))
}

pub fn insert_payment(conn: &Connection, import_id: i64, p: &PaymentRecord) -> Result<i64> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO payments (import_id, cpf, cpf_original, card_number, name, amount, competence_month, \
         competence_year, project, source_file, row_index, flags) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    stmt.execute(rusqlite::params![
        import_id,
        p.cpf,
        p.cpf_original,
        p.card_number,
        p.name,
        p.amount.to_string(),
        p.competence.month,
        p.competence.year,
        p.project,
        p.source_file,
        p.row_index as i64,
        p.flags.to_codes(),
    ])?;
    Ok(conn.last_insert_rowid())
}

pub fn update_flags(conn: &Connection, id: i64, flags: &FlagSet) -> Result<()> {
    let mut stmt = conn.prepare_cached("UPDATE payments SET flags = ?1 WHERE id = ?2")?;
    stmt.execute(rusqlite::params![flags.to_codes(), id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    #[test]
    fn test_init_db_creates_tables() {
        let (_dir, conn) = test_db();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for expected in &[
            "metadata", "users", "imports", "payments", "rejected_rows",
            "reconciliation_runs", "divergences", "audit_log",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table: {expected}");
        }
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let (_dir, conn) = test_db();
        init_db(&conn).unwrap();
    }

    #[test]
    fn test_bootstrap_creates_admin_once() {
        let (_dir, conn) = test_db();
        assert!(!is_initialized(&conn));
        assert!(bootstrap(&conn).unwrap());
        assert!(!bootstrap(&conn).unwrap());
        let admins: i64 = conn
            .query_row("SELECT count(*) FROM users WHERE role = 'admin'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(admins, 1);
        assert_eq!(audit::count(&conn, AuditAction::Bootstrap).unwrap(), 1);
        assert!(is_initialized(&conn));
    }

    #[test]
    fn test_bootstrap_respects_deleted_admin() {
        let (_dir, conn) = test_db();
        bootstrap(&conn).unwrap();
        conn.execute("DELETE FROM users WHERE name = 'admin'", []).unwrap();
        bootstrap(&conn).unwrap();
        let count: i64 = conn.query_row("SELECT count(*) FROM users", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_backup_copies_data() {
        let (dir, conn) = test_db();
        bootstrap(&conn).unwrap();
        let dest = dir.path().join("backups").join("copy.db");
        let size = backup_to(&conn, &dest).unwrap();
        assert!(size > 0);
        let copy = Connection::open(&dest).unwrap();
        let users: i64 = copy.query_row("SELECT count(*) FROM users", [], |r| r.get(0)).unwrap();
        assert_eq!(users, 1);
    }

    #[test]
    fn test_payment_roundtrip_keeps_decimal_and_flags() {
        let (_dir, conn) = test_db();
        conn.execute(
            "INSERT INTO imports (filename, imported_by, record_count, checksum) VALUES ('f.csv', 'admin', 1, 'x')",
            [],
        ).unwrap();
        let import_id = conn.last_insert_rowid();
        let mut flags = FlagSet::default();
        flags.insert(crate::models::AnomalyFlag::CardMultiCpf);
        let record = PaymentRecord {
            id: None,
            cpf: "12345678900".to_string(),
            cpf_original: "123.456.789-00".to_string(),
            card_number: "4455".to_string(),
            name: "Maria".to_string(),
            amount: Decimal::new(123456, 2),
            competence: Competence::new(3, 2025).unwrap(),
            project: Some("Frente Norte".to_string()),
            source_file: "f.csv".to_string(),
            row_index: 2,
            flags,
        };
        let id = insert_payment(&conn, import_id, &record).unwrap();
        let loaded = get_payment(&conn, id).unwrap();
        assert_eq!(loaded.amount, Decimal::new(123456, 2));
        assert!(loaded.flags.contains(crate::models::AnomalyFlag::CardMultiCpf));
        assert_eq!(loaded.competence, Competence::new(3, 2025).unwrap());
        assert_eq!(load_payments_for(&conn, loaded.competence).unwrap().len(), 1);
    }
}
