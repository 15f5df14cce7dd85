use std::collections::{BTreeMap, HashSet};

use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::db;
use crate::error::Result;
use crate::importer::cpf_problem;
use crate::models::{AnomalyFlag, Competence, PaymentRecord, ALL_FLAGS};
use crate::validator::canonical_names;

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

pub struct FlagLine {
    pub flag: AnomalyFlag,
    pub records: usize,
    pub amount: Decimal,
}

pub struct Summary {
    pub competence: Competence,
    pub beneficiaries: usize,
    pub payments: usize,
    pub cards: usize,
    pub projects: usize,
    pub total: Decimal,
    pub clean: usize,
    pub flagged: usize,
    pub flagged_amount: Decimal,
    /// Records holding a flag that keeps them out of the remittance.
    pub blocked: usize,
    pub by_flag: Vec<FlagLine>,
    pub duplicate_payments: usize,
    pub duplicate_amount: Decimal,
    pub rejected: i64,
    pub dropped: i64,
}

fn summarize(records: &[PaymentRecord], competence: Competence) -> Summary {
    let beneficiaries: HashSet<&str> = records.iter().map(|p| p.cpf.as_str()).collect();
    let cards: HashSet<&str> = records.iter().map(|p| p.card_number.as_str()).collect();
    let projects: HashSet<&str> = records.iter().filter_map(|p| p.project.as_deref()).collect();

    let mut by_flag: BTreeMap<AnomalyFlag, (usize, Decimal)> = BTreeMap::new();
    let (mut flagged, mut flagged_amount, mut blocked) = (0usize, Decimal::ZERO, 0usize);
    for p in records.iter().filter(|p| !p.flags.is_empty()) {
        flagged += 1;
        flagged_amount += p.amount;
        if p.flags.is_blocking() {
            blocked += 1;
        }
        for flag in p.flags.iter() {
            let entry = by_flag.entry(*flag).or_insert((0, Decimal::ZERO));
            entry.0 += 1;
            entry.1 += p.amount;
        }
    }
    let (duplicate_payments, duplicate_amount) = by_flag
        .get(&AnomalyFlag::DuplicateInvalid)
        .copied()
        .unwrap_or((0, Decimal::ZERO));

    Summary {
        competence,
        beneficiaries: beneficiaries.len(),
        payments: records.len(),
        cards: cards.len(),
        projects: projects.len(),
        total: records.iter().map(|p| p.amount).sum(),
        clean: records.len() - flagged,
        flagged,
        flagged_amount,
        blocked,
        by_flag: ALL_FLAGS
            .iter()
            .filter_map(|f| {
                by_flag.get(f).map(|(records, amount)| FlagLine {
                    flag: *f,
                    records: *records,
                    amount: *amount,
                })
            })
            .collect(),
        duplicate_payments,
        duplicate_amount,
        rejected: 0,
        dropped: 0,
    }
}

pub fn get_summary(conn: &Connection, competence: Competence) -> Result<Summary> {
    let records = db::load_payments_for(conn, competence)?;
    let mut summary = summarize(&records, competence);
    let (rejected, dropped) = import_counts(conn, competence)?;
    summary.rejected = rejected;
    summary.dropped = dropped;
    Ok(summary)
}

/// Rejected rows of `competence` and dropped rows of the imports that fed it.
fn import_counts(conn: &Connection, competence: Competence) -> Result<(i64, i64)> {
    let feeding = "SELECT DISTINCT import_id FROM payments WHERE competence_month = ?1 AND competence_year = ?2";
    let rejected: i64 = conn.query_row(
        "SELECT count(*) FROM rejected_rows WHERE competence_month = ?1 AND competence_year = ?2",
        rusqlite::params![competence.month, competence.year],
        |r| r.get(0),
    )?;
    let dropped: i64 = conn.query_row(
        &format!("SELECT coalesce(sum(dropped_count), 0) FROM imports WHERE id IN ({feeding})"),
        rusqlite::params![competence.month, competence.year],
        |r| r.get(0),
    )?;
    Ok((rejected, dropped))
}

// ---------------------------------------------------------------------------
// Flagged records
// ---------------------------------------------------------------------------

pub struct FlaggedRow {
    pub payment: PaymentRecord,
    /// Reported name for the cpf across all stored periods.
    pub canonical_name: Option<String>,
}

pub fn get_flagged(conn: &Connection, competence: Option<Competence>) -> Result<Vec<FlaggedRow>> {
    let all = db::load_payments(conn)?;
    let names = canonical_names(&all);
    Ok(all
        .into_iter()
        .filter(|p| !p.flags.is_empty())
        .filter(|p| competence.map_or(true, |c| p.competence == c))
        .map(|p| FlaggedRow {
            canonical_name: names.get(&p.cpf).cloned(),
            payment: p,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// CPF problems
// ---------------------------------------------------------------------------

pub struct CpfProblemRow {
    pub filename: String,
    pub line: i64,
    pub cpf_original: String,
    pub cpf: String,
    pub card_number: String,
    pub name: String,
    pub problem: String,
}

/// Every rejected row, with counts per cpf problem. A row missing only its
/// card has no cpf problem and is counted under `missing_card`.
#[derive(Default)]
pub struct CpfProblems {
    pub rows: Vec<CpfProblemRow>,
    pub empty: usize,
    pub invalid_characters: usize,
    pub wrong_length: usize,
    pub missing_card: usize,
}

pub fn get_cpf_problems(conn: &Connection, competence: Option<Competence>) -> Result<CpfProblems> {
    let mut stmt = conn.prepare(
        "SELECT i.filename, r.line, r.cpf_original, r.cpf, r.card_number, r.name, r.reasons \
         FROM rejected_rows r JOIN imports i ON r.import_id = i.id \
         WHERE (?1 IS NULL OR (r.competence_month = ?1 AND r.competence_year = ?2)) \
         ORDER BY r.import_id, r.line",
    )?;
    let raw = stmt
        .query_map(
            rusqlite::params![competence.map(|c| c.month), competence.map(|c| c.year)],
            |row| {
                Ok((
                    CpfProblemRow {
                        filename: row.get(0)?,
                        line: row.get(1)?,
                        cpf_original: row.get(2)?,
                        cpf: row.get(3)?,
                        card_number: row.get(4)?,
                        name: row.get(5)?,
                        problem: String::new(),
                    },
                    row.get::<_, String>(6)?,
                ))
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut problems = CpfProblems::default();
    for (mut row, reasons) in raw {
        let cpf = cpf_problem(&row.cpf_original, &row.cpf);
        match cpf.as_deref() {
            Some("empty") => problems.empty += 1,
            Some("invalid characters") => problems.invalid_characters += 1,
            Some(_) => problems.wrong_length += 1,
            None => {}
        }
        let no_card = row.card_number.is_empty();
        if no_card {
            problems.missing_card += 1;
        }
        row.problem = match (cpf, no_card) {
            (Some(p), true) => format!("{p}; missing card"),
            (Some(p), false) => p,
            (None, true) => "missing card".to_string(),
            (None, false) => reasons,
        };
        problems.rows.push(row);
    }
    Ok(problems)
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

pub struct ImportRow {
    pub id: i64,
    pub filename: String,
    pub import_date: String,
    pub imported_by: String,
    pub record_count: i64,
    pub stored: i64,
    pub dropped: i64,
    pub rejected: i64,
}

pub fn get_imports(conn: &Connection) -> Result<Vec<ImportRow>> {
    let mut stmt = conn.prepare(
        "SELECT i.id, i.filename, i.import_date, i.imported_by, i.record_count, \
         (SELECT count(*) FROM payments p WHERE p.import_id = i.id), i.dropped_count, i.rejected_count \
         FROM imports i ORDER BY i.id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ImportRow {
                id: row.get(0)?,
                filename: row.get(1)?,
                import_date: row.get(2)?,
                imported_by: row.get(3)?,
                record_count: row.get(4)?,
                stored: row.get(5)?,
                dropped: row.get(6)?,
                rejected: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub struct StatusInfo {
    pub payments: i64,
    pub flagged: i64,
    pub imports: i64,
    pub runs: i64,
    pub divergences: i64,
    pub users: i64,
    pub competences: Vec<Competence>,
    pub last_import: Option<String>,
}

pub fn get_status(conn: &Connection) -> Result<StatusInfo> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    let mut stmt = conn.prepare(
        "SELECT DISTINCT competence_month, competence_year FROM payments \
         ORDER BY competence_year, competence_month",
    )?;
    let competences = stmt
        .query_map([], |row| {
            Ok(Competence {
                month: row.get(0)?,
                year: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(StatusInfo {
        payments: count("SELECT count(*) FROM payments")?,
        flagged: count("SELECT count(*) FROM payments WHERE flags != ''")?,
        imports: count("SELECT count(*) FROM imports")?,
        runs: count("SELECT count(*) FROM reconciliation_runs")?,
        divergences: count("SELECT count(*) FROM divergences")?,
        users: count("SELECT count(*) FROM users")?,
        competences,
        last_import: conn
            .query_row("SELECT max(import_date) FROM imports", [], |r| r.get(0))
            .unwrap_or(None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{bootstrap, get_connection};
    use crate::importer::import_file;
    use crate::settings::Settings;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        bootstrap(&conn).unwrap();
        (dir, conn)
    }

    fn march() -> Competence {
        Competence::new(3, 2025).unwrap()
    }

    fn seed(dir: &tempfile::TempDir, conn: &Connection) {
        let path = dir.path().join("folha.csv");
        std::fs::write(
            &path,
            "CPF;Cartão;Nome;Valor;Projeto\n\
             123.456.789-00;5001;Ana;1.000,00;Norte\n\
             123.456.789-00;5001;Ana;1.000,00;Norte\n\
             222.333.444-55;5002;Bruno;500,00;Sul\n\
             ;5003;Caio;500,00;Sul\n\
             1234567890123;5004;Davi;500,00;Sul\n\
             TOTAL;;;3.000,00;\n",
        )
        .unwrap();
        import_file(conn, &path, Some(march()), "admin", &Settings::default()).unwrap();
    }

    #[test]
    fn test_summary_metrics() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let s = get_summary(&conn, march()).unwrap();
        assert_eq!(s.payments, 3);
        assert_eq!(s.beneficiaries, 2);
        assert_eq!(s.cards, 2);
        assert_eq!(s.projects, 2);
        assert_eq!(s.total, Decimal::new(250000, 2));
        assert_eq!(s.flagged, 2);
        assert_eq!(s.clean, 1);
        assert_eq!(s.duplicate_payments, 2);
        assert_eq!(s.duplicate_amount, Decimal::new(200000, 2));
        assert_eq!(s.rejected, 2);
        assert_eq!(s.dropped, 1);
        assert_eq!(s.by_flag.len(), 1);
        assert_eq!(s.by_flag[0].flag, AnomalyFlag::DuplicateInvalid);
    }

    #[test]
    fn test_summary_of_empty_period() {
        let (_dir, conn) = test_db();
        let s = get_summary(&conn, march()).unwrap();
        assert_eq!(s.payments, 0);
        assert_eq!(s.total, Decimal::ZERO);
    }

    #[test]
    fn test_flagged_carries_canonical_name() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let rows = get_flagged(&conn, Some(march())).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].canonical_name.as_deref(), Some("Ana"));
        assert!(get_flagged(&conn, Some(Competence::new(4, 2025).unwrap())).unwrap().is_empty());
    }

    #[test]
    fn test_cpf_problems_grouped() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let p = get_cpf_problems(&conn, None).unwrap();
        assert_eq!(p.rows.len(), 2);
        assert_eq!(p.empty, 1);
        assert_eq!(p.wrong_length, 1);
        assert_eq!(p.missing_card, 0);
        assert_eq!(p.rows[1].problem, "wrong length (13 digits)");
        assert_eq!(p.rows[0].filename, "folha.csv");
    }

    #[test]
    fn test_row_missing_only_its_card_is_listed() {
        let (dir, conn) = test_db();
        let path = dir.path().join("cartao.csv");
        std::fs::write(&path, "CPF;Cartão;Nome;Valor\n12345678900;5001;Ana;10,00\n98765432100;;Bruno;10,00\n").unwrap();
        let result = import_file(&conn, &path, Some(march()), "admin", &Settings::default()).unwrap();
        assert_eq!(result.rejected, 1);

        let stored: i64 = conn.query_row("SELECT count(*) FROM rejected_rows", [], |r| r.get(0)).unwrap();
        let p = get_cpf_problems(&conn, None).unwrap();
        assert_eq!(p.rows.len() as i64, stored);
        assert_eq!(p.missing_card, 1);
        assert_eq!(p.empty + p.invalid_characters + p.wrong_length, 0);
        assert_eq!(p.rows[0].name, "Bruno");
        assert_eq!(p.rows[0].problem, "missing card");
    }

    #[test]
    fn test_cpf_problems_filtered_by_competence() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        assert_eq!(get_cpf_problems(&conn, Some(march())).unwrap().rows.len(), 2);
        let april = Competence::new(4, 2025).unwrap();
        assert!(get_cpf_problems(&conn, Some(april)).unwrap().rows.is_empty());
    }

    #[test]
    fn test_imports_and_status() {
        let (dir, conn) = test_db();
        seed(&dir, &conn);
        let imports = get_imports(&conn).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].stored, 3);
        assert_eq!(imports[0].rejected, 2);
        let status = get_status(&conn).unwrap();
        assert_eq!(status.payments, 3);
        assert_eq!(status.flagged, 2);
        assert_eq!(status.users, 1);
        assert_eq!(status.competences, vec![march()]);
        assert!(status.last_import.is_some());
    }
}
