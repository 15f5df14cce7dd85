//! Privileged operator actions. Every function checks the actor's role
//! before touching anything and leaves an audit entry behind.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;

use crate::audit::{self, AuditAction, AuditLogEntry, AuditSink};
use crate::db;
use crate::error::{MalhaError, Result};
use crate::importer::revalidate_stored;
use crate::models::PaymentRecord;
use crate::permissions::{Actor, Capability, Role};
use crate::settings::DuplicatePolicy;
use crate::text::{normalize_card, normalize_cpf};
use crate::validator::missing_flags;

#[derive(Debug, Default, Clone)]
pub struct RecordEdit {
    pub cpf: Option<String>,
    pub card_number: Option<String>,
    pub name: Option<String>,
    pub amount: Option<Decimal>,
}

impl RecordEdit {
    pub fn is_empty(&self) -> bool {
        self.cpf.is_none() && self.card_number.is_none() && self.name.is_none() && self.amount.is_none()
    }
}

/// Apply `edit` to a stored payment and re-run the validator, since a fix
/// to one record can clear or raise flags on others.
pub fn edit_record(
    conn: &Connection,
    actor: &Actor,
    id: i64,
    edit: &RecordEdit,
    policy: DuplicatePolicy,
) -> Result<PaymentRecord> {
    let entity = format!("payment:{id}");
    actor.require(conn, Capability::EditRecord, &entity)?;
    if edit.is_empty() {
        return Err(MalhaError::Other("nothing to change".to_string()));
    }
    let mut record = db::get_payment(conn, id)?;
    let mut changes = Vec::new();
    if let Some(cpf) = &edit.cpf {
        let cpf = normalize_cpf(cpf);
        changes.push(format!("cpf: {} -> {cpf}", record.cpf));
        record.cpf = cpf;
    }
    if let Some(card) = &edit.card_number {
        let card = normalize_card(card);
        changes.push(format!("card: {} -> {card}", record.card_number));
        record.card_number = card;
    }
    if let Some(name) = &edit.name {
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        changes.push(format!("name: {} -> {name}", record.name));
        record.name = name;
    }
    if let Some(amount) = edit.amount {
        if amount.is_sign_negative() {
            return Err(MalhaError::InvalidAmount(amount.to_string()));
        }
        changes.push(format!("amount: {} -> {amount}", record.amount));
        record.amount = amount;
    }
    let missing = missing_flags(&record);
    if !missing.is_empty() {
        return Err(MalhaError::Other(format!(
            "edit would leave payment {id} with {}",
            missing.to_codes()
        )));
    }

    let mut entries: Vec<AuditLogEntry> = Vec::new();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE payments SET cpf = ?1, card_number = ?2, name = ?3, amount = ?4 WHERE id = ?5",
        rusqlite::params![record.cpf, record.card_number, record.name, record.amount.to_string(), id],
    )?;
    entries.emit(AuditLogEntry::now(&actor.name, AuditAction::RecordEdited, entity, changes.join("; ")));
    revalidate_stored(&tx, &actor.name, policy, &mut entries)?;
    audit::persist(&tx, &entries)?;
    tx.commit()?;
    tracing::info!(id, user = %actor.name, "payment edited");
    db::get_payment(conn, id)
}

pub fn delete_record(conn: &Connection, actor: &Actor, id: i64, policy: DuplicatePolicy) -> Result<()> {
    let entity = format!("payment:{id}");
    actor.require(conn, Capability::EditRecord, &entity)?;
    let record = db::get_payment(conn, id)?;

    let mut entries: Vec<AuditLogEntry> = Vec::new();
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM payments WHERE id = ?1", [id])?;
    entries.emit(AuditLogEntry::now(
        &actor.name,
        AuditAction::RecordDeleted,
        entity,
        format!(
            "{} {} {} {} ({}#{})",
            record.competence, record.cpf, record.name, record.amount, record.source_file, record.row_index
        ),
    ));
    revalidate_stored(&tx, &actor.name, policy, &mut entries)?;
    audit::persist(&tx, &entries)?;
    tx.commit()?;
    Ok(())
}

/// Remove an uploaded file with its payments and rejected rows. Returns the
/// number of payments removed.
pub fn delete_import(conn: &Connection, actor: &Actor, import_id: i64, policy: DuplicatePolicy) -> Result<usize> {
    let entity = format!("import:{import_id}");
    actor.require(conn, Capability::DeleteFile, &entity)?;
    let filename: String = conn
        .query_row("SELECT filename FROM imports WHERE id = ?1", [import_id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| MalhaError::NotFound(entity.clone()))?;

    let mut entries: Vec<AuditLogEntry> = Vec::new();
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute("DELETE FROM payments WHERE import_id = ?1", [import_id])?;
    tx.execute("DELETE FROM rejected_rows WHERE import_id = ?1", [import_id])?;
    tx.execute("DELETE FROM imports WHERE id = ?1", [import_id])?;
    entries.emit(AuditLogEntry::now(
        &actor.name,
        AuditAction::FileDeleted,
        entity,
        format!("{filename}: {removed} payments removed"),
    ));
    revalidate_stored(&tx, &actor.name, policy, &mut entries)?;
    audit::persist(&tx, &entries)?;
    tx.commit()?;
    tracing::info!(import = import_id, %filename, removed, "import deleted");
    Ok(removed)
}

/// Clear divergences of one run, or of every run. Runs themselves stay.
pub fn clear_divergences(conn: &Connection, actor: &Actor, run_id: Option<i64>) -> Result<usize> {
    let entity = run_id.map_or_else(|| "divergences:all".to_string(), |id| format!("run:{id}"));
    actor.require(conn, Capability::ClearDivergences, &entity)?;
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute("DELETE FROM divergences WHERE (?1 IS NULL OR run_id = ?1)", [run_id])?;
    audit::record(
        &tx,
        AuditLogEntry::now(
            &actor.name,
            AuditAction::DivergencesCleared,
            entity,
            format!("{removed} divergences removed"),
        ),
    )?;
    tx.commit()?;
    Ok(removed)
}

/// Back up, then wipe payments, imports and reconciliation history. Users,
/// the bootstrap marker and the audit trail survive.
pub fn reset_database(conn: &Connection, actor: &Actor, backup_path: &Path) -> Result<u64> {
    actor.require(conn, Capability::ResetDatabase, "database")?;
    let size = db::backup_to(conn, backup_path)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "DELETE FROM divergences;
         DELETE FROM reconciliation_runs;
         DELETE FROM rejected_rows;
         DELETE FROM payments;
         DELETE FROM imports;",
    )?;
    audit::record(
        &tx,
        AuditLogEntry::now(
            &actor.name,
            AuditAction::DatabaseReset,
            "database",
            format!("backup at {}", backup_path.display()),
        ),
    )?;
    tx.commit()?;
    tracing::warn!(user = %actor.name, backup = %backup_path.display(), "database reset");
    Ok(size)
}

pub fn add_user(conn: &Connection, actor: &Actor, name: &str, role: Role) -> Result<()> {
    let entity = format!("user:{name}");
    actor.require(conn, Capability::ManageUsers, &entity)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(MalhaError::Other("user name cannot be empty".to_string()));
    }
    let tx = conn.unchecked_transaction()?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO users (name, role) VALUES (?1, ?2)",
        [name, role.key()],
    )?;
    if inserted == 0 {
        return Err(MalhaError::Other(format!("user '{name}' already exists")));
    }
    audit::record(
        &tx,
        AuditLogEntry::now(&actor.name, AuditAction::UserCreated, entity, format!("role {role}")),
    )?;
    tx.commit()?;
    Ok(())
}

pub fn list_users(conn: &Connection) -> Result<Vec<(String, String, String)>> {
    let mut stmt = conn.prepare("SELECT name, role, coalesce(created_at, '') FROM users ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{bootstrap, get_connection};
    use crate::importer::import_file;
    use crate::models::{AnomalyFlag, Competence};
    use crate::settings::Settings;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        bootstrap(&conn).unwrap();
        conn.execute("INSERT INTO users (name, role) VALUES ('bia', 'analyst'), ('leo', 'lead')", [])
            .unwrap();
        (dir, conn)
    }

    fn actor(conn: &Connection, name: &str) -> Actor {
        Actor::resolve(conn, name).unwrap()
    }

    fn seed(dir: &tempfile::TempDir, conn: &Connection) -> i64 {
        let path = dir.path().join("folha.csv");
        std::fs::write(
            &path,
            "CPF;Cartão;Nome;Valor\n\
             12345678900;5001;Ana;100,00\n\
             12345678900;5002;Ana;100,00\n\
             98765432100;6001;Bruno;100,00\n",
        )
        .unwrap();
        let march = Competence::new(3, 2025).unwrap();
        import_file(conn, &path, Some(march), "admin", &Settings::default())
            .unwrap()
            .import_id
    }

    fn payment_id(conn: &Connection, card: &str) -> i64 {
        conn.query_row("SELECT id FROM payments WHERE card_number = ?1", [card], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_analyst_cannot_edit() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let id = payment_id(&conn, "5002");
        let edit = RecordEdit {
            name: Some("Outra".to_string()),
            ..Default::default()
        };
        let err = edit_record(&conn, &actor(&conn, "bia"), id, &edit, DuplicatePolicy::CpfAmount).unwrap_err();
        assert!(matches!(err, MalhaError::PermissionDenied { .. }));
        assert_eq!(db::get_payment(&conn, id).unwrap().name, "Ana");
        assert_eq!(audit::count(&conn, AuditAction::AccessDenied).unwrap(), 1);
    }

    #[test]
    fn test_edit_clears_flags_of_group() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let id = payment_id(&conn, "5002");
        assert!(db::get_payment(&conn, id).unwrap().flags.contains(AnomalyFlag::CpfCardConflict));
        let edit = RecordEdit {
            card_number: Some("5001".to_string()),
            amount: Some(Decimal::new(15000, 2)),
            ..Default::default()
        };
        let edited = edit_record(&conn, &actor(&conn, "leo"), id, &edit, DuplicatePolicy::CpfAmount).unwrap();
        assert!(edited.flags.is_empty());
        let other = db::get_payment(&conn, payment_id(&conn, "6001")).unwrap();
        assert!(other.flags.is_empty());
        assert_eq!(audit::count(&conn, AuditAction::RecordEdited).unwrap(), 1);
    }

    #[test]
    fn test_edit_cannot_blank_identifier() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let id = payment_id(&conn, "6001");
        let edit = RecordEdit {
            cpf: Some(String::new()),
            ..Default::default()
        };
        assert!(edit_record(&conn, &actor(&conn, "admin"), id, &edit, DuplicatePolicy::CpfAmount).is_err());
    }

    #[test]
    fn test_delete_import_cascades_and_audits() {
        let (dir, conn) = test_db();
        let import_id = seed(&dir, &conn);
        assert!(delete_import(&conn, &actor(&conn, "bia"), import_id, DuplicatePolicy::CpfAmount).is_err());
        let removed = delete_import(&conn, &actor(&conn, "leo"), import_id, DuplicatePolicy::CpfAmount).unwrap();
        assert_eq!(removed, 3);
        let left: i64 = conn.query_row("SELECT count(*) FROM imports", [], |r| r.get(0)).unwrap();
        assert_eq!(left, 0);
        assert_eq!(audit::count(&conn, AuditAction::FileDeleted).unwrap(), 1);
    }

    #[test]
    fn test_delete_record_revalidates() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let id = payment_id(&conn, "5002");
        delete_record(&conn, &actor(&conn, "admin"), id, DuplicatePolicy::CpfAmount).unwrap();
        let survivor = db::get_payment(&conn, payment_id(&conn, "5001")).unwrap();
        assert!(survivor.flags.is_empty());
        assert!(matches!(db::get_payment(&conn, id), Err(MalhaError::NotFound(_))));
    }

    #[test]
    fn test_clear_divergences_requires_lead() {
        let (_dir, conn) = test_db();
        conn.execute(
            "INSERT INTO reconciliation_runs (competence_month, competence_year, bank_file, status, run_by, started_at) \
             VALUES (3, 2025, 'r.txt', 'COMPLETED', 'admin', '2025-04-01')",
            [],
        )
        .unwrap();
        let run = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO divergences (run_id, cpf, divergence_type) VALUES (?1, '1', 'MISSING_IN_BANK')",
            [run],
        )
        .unwrap();
        assert!(clear_divergences(&conn, &actor(&conn, "bia"), None).is_err());
        assert_eq!(clear_divergences(&conn, &actor(&conn, "leo"), Some(run)).unwrap(), 1);
        assert_eq!(audit::count(&conn, AuditAction::DivergencesCleared).unwrap(), 1);
    }

    #[test]
    fn test_reset_keeps_users_and_backs_up() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let backup = dir.path().join("backups").join("before-reset.db");
        assert!(reset_database(&conn, &actor(&conn, "leo"), &backup).is_err());
        assert!(!backup.exists());
        reset_database(&conn, &actor(&conn, "admin"), &backup).unwrap();
        assert!(backup.exists());
        let payments: i64 = conn.query_row("SELECT count(*) FROM payments", [], |r| r.get(0)).unwrap();
        assert_eq!(payments, 0);
        assert_eq!(list_users(&conn).unwrap().len(), 3);
        assert!(db::is_initialized(&conn));
        assert!(!bootstrap(&conn).unwrap());
    }

    #[test]
    fn test_add_user() {
        let (_dir, conn) = test_db();
        assert!(add_user(&conn, &actor(&conn, "leo"), "caio", Role::Analyst).is_err());
        add_user(&conn, &actor(&conn, "admin"), "caio", Role::Analyst).unwrap();
        assert!(add_user(&conn, &actor(&conn, "admin"), "caio", Role::Lead).is_err());
        assert_eq!(actor(&conn, "caio").role, Role::Analyst);
        assert_eq!(audit::count(&conn, AuditAction::UserCreated).unwrap(), 1);
    }
}
