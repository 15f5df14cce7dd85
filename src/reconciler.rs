use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rusqlite::Connection;

use crate::audit::{self, AuditAction, AuditLogEntry, AuditSink};
use crate::db;
use crate::error::{MalhaError, Result};
use crate::layout::{self, bank_return, LINE_WIDTH};
use crate::models::{BankReturnRecord, Competence, DivergenceRecord, DivergenceType, PaymentRecord};
use crate::text::{digits_only, normalize_name};
use crate::validator::canonical_names;

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::CompletedWithErrors)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationRun {
    pub competence: Competence,
    pub bank_file: String,
    pub status: RunStatus,
    pub matched: usize,
    pub parse_errors: usize,
    pub cause: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

fn now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl ReconciliationRun {
    pub fn new(competence: Competence, bank_file: &str) -> Self {
        Self {
            competence,
            bank_file: bank_file.to_string(),
            status: RunStatus::Pending,
            matched: 0,
            parse_errors: 0,
            cause: None,
            started_at: now(),
            finished_at: None,
        }
    }

    pub fn advance(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MalhaError::IllegalTransition {
                from: self.status.code().to_string(),
                to: next.code().to_string(),
            });
        }
        tracing::debug!(file = %self.bank_file, from = self.status.code(), to = next.code(), "run transition");
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(now());
        }
        Ok(())
    }

    fn insert(&self, conn: &Connection, actor: &str) -> Result<i64> {
        conn.execute(
            "INSERT INTO reconciliation_runs (competence_month, competence_year, bank_file, status, matched, \
             parse_errors, cause, run_by, started_at, finished_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                self.competence.month,
                self.competence.year,
                self.bank_file,
                self.status.code(),
                self.matched as i64,
                self.parse_errors as i64,
                self.cause,
                actor,
                self.started_at,
                self.finished_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

// ---------------------------------------------------------------------------
// Bank return parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Detail(BankReturnRecord),
    /// Header, trailer or empty line.
    Skipped,
    Error { cpf: String, reason: String },
}

pub fn parse_line(bytes: &[u8], line_number: usize) -> ParsedLine {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return ParsedLine::Skipped;
    }
    let cpf_field = layout::slice(bytes, &bank_return::CPF).unwrap_or_default();
    let error = |reason: String| ParsedLine::Error {
        cpf: digits_only(&cpf_field),
        reason,
    };
    match bytes.first() {
        Some(b'0') | Some(b'9') => return ParsedLine::Skipped,
        Some(b'1') => {}
        Some(other) => return error(format!("unknown record type '{}'", char::from(*other))),
        None => return ParsedLine::Skipped,
    }
    if bytes.len() != LINE_WIDTH {
        return error(format!("wrong length: {} bytes, expected {LINE_WIDTH}", bytes.len()));
    }
    if cpf_field.len() != 11 || !cpf_field.bytes().all(|b| b.is_ascii_digit()) {
        return error(format!("invalid cpf '{cpf_field}'"));
    }
    let card = layout::slice(bytes, &bank_return::CARD).unwrap_or_default();
    if !card.bytes().all(|b| b.is_ascii_digit()) {
        return error(format!("invalid card number '{card}'"));
    }
    let card = card.trim_start_matches('0').to_string();
    ParsedLine::Detail(BankReturnRecord {
        cpf: cpf_field,
        name: layout::slice(bytes, &bank_return::NAME).unwrap_or_default(),
        card_number: card,
        line_number,
    })
}

#[derive(Debug, Default)]
pub struct BankFile {
    pub records: Vec<BankReturnRecord>,
    pub errors: Vec<DivergenceRecord>,
}

/// Stream the file line by line. Bad lines become PARSE_ERROR divergences.
pub fn read_bank_file<R: BufRead>(reader: R) -> Result<BankFile> {
    let mut file = BankFile::default();
    let mut seen: HashSet<String> = HashSet::new();
    for (i, line) in reader.split(b'\n').enumerate() {
        let line = line?;
        let line_number = i + 1;
        match parse_line(&line, line_number) {
            ParsedLine::Detail(record) => {
                if !seen.insert(record.cpf.clone()) {
                    tracing::warn!(cpf = %record.cpf, line = line_number, "repeated cpf in bank file, keeping first");
                    continue;
                }
                file.records.push(record);
            }
            ParsedLine::Skipped => {}
            ParsedLine::Error { cpf, reason } => {
                tracing::warn!(line = line_number, %reason, "unparseable bank line");
                file.errors.push(DivergenceRecord {
                    cpf,
                    system_name: None,
                    bank_name: None,
                    divergence_type: DivergenceType::ParseError,
                    detail: format!("line {line_number}: {reason}"),
                });
            }
        }
    }
    Ok(file)
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Comparison {
    pub matched: usize,
    pub divergences: Vec<DivergenceRecord>,
}

/// Join on cpf. Several system records for one cpf collapse to its
/// canonical name and the set of cards it was paid on. Cards compare
/// without leading zeros since the bank pads them.
pub fn compare(system: &[PaymentRecord], bank: &[BankReturnRecord]) -> Comparison {
    let names = canonical_names(system);
    let mut cards: BTreeMap<&str, HashSet<&str>> = BTreeMap::new();
    for p in system.iter().filter(|p| names.contains_key(&p.cpf)) {
        cards
            .entry(p.cpf.as_str())
            .or_default()
            .insert(p.card_number.trim_start_matches('0'));
    }
    let bank_by_cpf: HashMap<&str, &BankReturnRecord> = bank.iter().map(|b| (b.cpf.as_str(), b)).collect();

    let mut result = Comparison::default();
    for (cpf, system_cards) in &cards {
        let system_name = names.get(*cpf).cloned();
        let Some(b) = bank_by_cpf.get(cpf) else {
            result.divergences.push(DivergenceRecord {
                cpf: cpf.to_string(),
                system_name,
                bank_name: None,
                divergence_type: DivergenceType::MissingInBank,
                detail: String::new(),
            });
            continue;
        };
        result.matched += 1;
        let system_display = system_name.clone().unwrap_or_default();
        if normalize_name(&system_display) != normalize_name(&b.name) {
            result.divergences.push(DivergenceRecord {
                cpf: cpf.to_string(),
                system_name: system_name.clone(),
                bank_name: Some(b.name.clone()),
                divergence_type: DivergenceType::NameMismatch,
                detail: format!("bank line {}", b.line_number),
            });
        }
        if !b.card_number.is_empty() && !system_cards.contains(b.card_number.as_str()) {
            let mut known: Vec<&str> = system_cards.iter().copied().collect();
            known.sort_unstable();
            result.divergences.push(DivergenceRecord {
                cpf: cpf.to_string(),
                system_name,
                bank_name: Some(b.name.clone()),
                divergence_type: DivergenceType::CardMismatch,
                detail: format!("bank card {} not in [{}]", b.card_number, known.join(", ")),
            });
        }
    }
    for b in bank {
        if !cards.contains_key(b.cpf.as_str()) {
            result.divergences.push(DivergenceRecord {
                cpf: b.cpf.clone(),
                system_name: None,
                bank_name: Some(b.name.clone()),
                divergence_type: DivergenceType::MissingInSystem,
                detail: format!("bank line {}", b.line_number),
            });
        }
    }
    result
}

// ---------------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------------

pub struct ReconcileResult {
    pub run_id: i64,
    pub status: RunStatus,
    pub matched: usize,
    pub bank_records: usize,
    pub system_cpfs: usize,
    pub divergences: Vec<DivergenceRecord>,
}

impl ReconcileResult {
    pub fn count(&self, kind: DivergenceType) -> usize {
        self.divergences.iter().filter(|d| d.divergence_type == kind).count()
    }
}

fn fail(conn: &Connection, mut run: ReconciliationRun, actor: &str, cause: String) -> Result<ReconcileResult> {
    run.advance(RunStatus::Failed)?;
    run.cause = Some(cause.clone());
    let tx = conn.unchecked_transaction()?;
    let run_id = run.insert(&tx, actor)?;
    audit::record(
        &tx,
        AuditLogEntry::now(actor, AuditAction::ReconciliationRun, format!("run:{run_id}"), format!("FAILED: {cause}")),
    )?;
    tx.commit()?;
    tracing::error!(file = %run.bank_file, %cause, "reconciliation failed");
    Err(MalhaError::ReconciliationFailed {
        file: run.bank_file,
        cause,
    })
}

pub fn reconcile(conn: &Connection, bank_path: &Path, competence: Competence, actor: &str) -> Result<ReconcileResult> {
    let file_name = bank_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();
    let mut run = ReconciliationRun::new(competence, &file_name);
    run.advance(RunStatus::Running)?;

    let file = match File::open(bank_path) {
        Ok(f) => f,
        Err(e) => return fail(conn, run, actor, e.to_string()),
    };
    let parsed = match read_bank_file(BufReader::new(file)) {
        Ok(p) => p,
        Err(e) => return fail(conn, run, actor, e.to_string()),
    };
    if parsed.records.is_empty() {
        let cause = format!("no valid detail lines ({} unparseable)", parsed.errors.len());
        return fail(conn, run, actor, cause);
    }

    let system = db::load_payments_for(conn, competence)?;
    let comparison = compare(&system, &parsed.records);
    let system_cpfs = canonical_names(&system).len();

    run.matched = comparison.matched;
    run.parse_errors = parsed.errors.len();
    run.advance(if parsed.errors.is_empty() {
        RunStatus::Completed
    } else {
        RunStatus::CompletedWithErrors
    })?;

    let mut divergences = parsed.errors;
    divergences.extend(comparison.divergences);

    let mut entries: Vec<AuditLogEntry> = Vec::new();
    let tx = conn.unchecked_transaction()?;
    let run_id = run.insert(&tx, actor)?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO divergences (run_id, cpf, system_name, bank_name, divergence_type, detail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for d in &divergences {
            stmt.execute(rusqlite::params![
                run_id,
                d.cpf,
                d.system_name,
                d.bank_name,
                d.divergence_type.code(),
                d.detail
            ])?;
            entries.emit(AuditLogEntry::now(
                actor,
                AuditAction::DivergenceCreated,
                format!("run:{run_id}/cpf:{}", d.cpf),
                d.divergence_type.code(),
            ));
        }
    }
    entries.emit(AuditLogEntry::now(
        actor,
        AuditAction::ReconciliationRun,
        format!("run:{run_id}"),
        format!(
            "{} {competence}: {} matched, {} divergences",
            run.status.code(),
            run.matched,
            divergences.len()
        ),
    ));
    audit::persist(&tx, &entries)?;
    tx.commit()?;

    tracing::info!(
        run = run_id,
        status = run.status.code(),
        matched = run.matched,
        divergences = divergences.len(),
        "reconciliation finished"
    );

    Ok(ReconcileResult {
        run_id,
        status: run.status,
        matched: run.matched,
        bank_records: parsed.records.len(),
        system_cpfs,
        divergences,
    })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub struct RunRow {
    pub id: i64,
    pub competence: String,
    pub bank_file: String,
    pub status: String,
    pub matched: i64,
    pub parse_errors: i64,
    pub divergences: i64,
    pub run_by: String,
    pub started_at: String,
}

pub fn list_runs(conn: &Connection) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, printf('%02d/%d', r.competence_month, r.competence_year), r.bank_file, r.status, \
         r.matched, r.parse_errors, (SELECT count(*) FROM divergences d WHERE d.run_id = r.id), \
         r.run_by, r.started_at \
         FROM reconciliation_runs r ORDER BY r.id DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                competence: row.get(1)?,
                bank_file: row.get(2)?,
                status: row.get(3)?,
                matched: row.get(4)?,
                parse_errors: row.get(5)?,
                divergences: row.get(6)?,
                run_by: row.get(7)?,
                started_at: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct StoredDivergence {
    pub run_id: i64,
    pub record: DivergenceRecord,
}

pub fn list_divergences(conn: &Connection, run_id: Option<i64>) -> Result<Vec<StoredDivergence>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, cpf, system_name, bank_name, divergence_type, detail FROM divergences \
         WHERE (?1 IS NULL OR run_id = ?1) ORDER BY run_id, id",
    )?;
    let raw: Vec<(i64, String, Option<String>, Option<String>, String, String)> = stmt
        .query_map([run_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(run_id, cpf, system_name, bank_name, kind, detail)| {
            Ok(StoredDivergence {
                run_id,
                record: DivergenceRecord {
                    cpf,
                    system_name,
                    bank_name,
                    divergence_type: kind.parse()?,
                    detail,
                },
            })
        })
        .collect()
}
