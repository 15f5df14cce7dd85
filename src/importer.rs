use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::Connection;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::audit::{self, AuditAction, AuditLogEntry, AuditSink};
use crate::columns::{map_headers, CanonicalField, ColumnMapping, SynonymTable, REQUIRED_FIELDS};
use crate::db;
use crate::error::{MalhaError, Result};
use crate::layout::decode_latin1;
use crate::models::{AnomalyFlag, Competence, PaymentRecord, RawRecord, RejectedRow};
use crate::sanitizer::{DroppedRow, Sanitizer};
use crate::settings::{DuplicatePolicy, Settings};
use crate::text::{normalize_card, normalize_cpf};
use crate::validator::{self, ValidationOutcome};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn currency_noise() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)r\$|\s|\x{a0}").ok())
        .as_ref()
}

/// Parse a money cell. Accepts `1.234,56`, `R$ 1.234,56`, `1234.56`,
/// `1,234.56` and `(12,00)` for negatives. A single dot followed by exactly
/// three digits is a thousands separator.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let s = match currency_noise() {
        Some(re) => re.replace_all(raw, "").into_owned(),
        None => raw.split_whitespace().collect(),
    };
    let negative = s.starts_with('-') || (s.starts_with('(') && s.ends_with(')'));
    let s = s.trim_matches(|c| c == '-' || c == '(' || c == ')' || c == '+');
    if s.is_empty() {
        return None;
    }
    let normalized = match (s.rfind(','), s.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(_), None) if s.matches(',').count() == 1 => s.replace(',', "."),
        (Some(_), None) => s.replace(',', ""),
        (None, Some(dot)) if s.matches('.').count() > 1 || s.len() - dot - 1 == 3 => s.replace('.', ""),
        _ => s.to_string(),
    };
    let value = Decimal::from_str(&normalized).ok()?;
    Some(if negative { -value } else { value })
}

/// Whole number in a cell, tolerating the `.0` spreadsheets append.
fn parse_number(raw: &str) -> Option<i64> {
    let t = raw.trim();
    t.strip_suffix(".0").unwrap_or(t).parse().ok()
}

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn unreadable(path: &Path, cause: impl ToString) -> MalhaError {
    MalhaError::UnreadableFile {
        file: path.display().to_string(),
        cause: cause.to_string(),
    }
}

/// Why a cpf cell could not be used, in the words of the CPF problems report.
pub fn cpf_problem(original: &str, normalized: &str) -> Option<String> {
    if original.trim().is_empty() {
        return Some("empty".to_string());
    }
    if normalized.is_empty() {
        return Some("invalid characters".to_string());
    }
    if normalized.len() != 11 {
        return Some(format!("wrong length ({} digits)", normalized.len()));
    }
    None
}

// ---------------------------------------------------------------------------
// Reading spreadsheets
// ---------------------------------------------------------------------------

pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
}

/// UTF-8 (with or without BOM), else ISO-8859-1.
pub fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            tracing::debug!("input is not UTF-8, decoding as latin-1");
            decode_latin1(bytes)
        }
    }
}

/// Pick `;`, `,` or tab from the first non-empty line.
pub fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    [b';', b',', b'\t']
        .into_iter()
        .map(|d| (header.bytes().filter(|&b| b == d).count(), d))
        .fold((0, b';'), |best, cur| if cur.0 > best.0 { cur } else { best })
        .1
}

fn sheet_from_rows(rows: impl Iterator<Item = (usize, Vec<String>)>) -> Sheet {
    let mut headers: Option<Vec<String>> = None;
    let mut records = Vec::new();
    for (line, cells) in rows {
        let Some(hs) = &headers else {
            if cells.iter().any(|c| !c.trim().is_empty()) {
                headers = Some(cells.iter().map(|c| c.trim().to_string()).collect());
            }
            continue;
        };
        let cells = hs
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), cells.get(i).cloned().unwrap_or_default()))
            .collect();
        records.push(RawRecord { line, cells });
    }
    Sheet {
        headers: headers.unwrap_or_default(),
        rows: records,
    }
}

pub fn read_csv_text(text: &str) -> Result<Sheet> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let record = result?;
        let line = record.position().map(|p| p.line() as usize).unwrap_or(i + 1);
        rows.push((line, record.iter().map(str::to_string).collect()));
    }
    Ok(sheet_from_rows(rows.into_iter()))
}

#[cfg(feature = "xlsx")]
fn read_workbook(path: &Path) -> Result<Sheet> {
    use calamine::{open_workbook_auto, Data, Reader};

    fn cell_text(cell: &Data) -> String {
        match cell {
            Data::String(s) => s.clone(),
            Data::Int(i) => i.to_string(),
            Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
            Data::Float(f) => format!("{f:.2}"),
            Data::Bool(b) => b.to_string(),
            _ => String::new(),
        }
    }

    let mut workbook = open_workbook_auto(path).map_err(|e| unreadable(path, e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| unreadable(path, "workbook has no sheets"))?
        .map_err(|e| unreadable(path, e))?;
    let first_row = range.start().map(|(r, _)| r as usize).unwrap_or(0);
    let rows = range
        .rows()
        .enumerate()
        .map(|(i, row)| (first_row + i + 1, row.iter().map(cell_text).collect()));
    Ok(sheet_from_rows(rows))
}

#[cfg(not(feature = "xlsx"))]
fn read_workbook(path: &Path) -> Result<Sheet> {
    Err(unreadable(path, "built without spreadsheet support"))
}

pub fn read_sheet(path: &Path, data: &[u8]) -> Result<Sheet> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let sheet = match ext.as_str() {
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path)?,
        _ => read_csv_text(&decode(data)).map_err(|e| unreadable(path, e))?,
    };
    if sheet.headers.is_empty() {
        return Err(unreadable(path, "no header row"));
    }
    Ok(sheet)
}

// ---------------------------------------------------------------------------
// Row -> PaymentRecord
// ---------------------------------------------------------------------------

fn cell<'r>(mapping: &ColumnMapping, row: &'r RawRecord, field: CanonicalField) -> &'r str {
    mapping
        .index_of(field)
        .and_then(|i| row.cells.get(i))
        .map(|(_, v)| v.trim())
        .unwrap_or("")
}

fn row_competence(mapping: &ColumnMapping, row: &RawRecord) -> std::result::Result<Competence, String> {
    let month_raw = cell(mapping, row, CanonicalField::Month);
    if month_raw.contains(['/', '-']) {
        return Competence::parse(month_raw).map_err(|e| e.to_string());
    }
    let year_raw = cell(mapping, row, CanonicalField::Year);
    let month = parse_number(month_raw).ok_or_else(|| format!("unparseable month '{month_raw}'"))?;
    let year = parse_number(year_raw).ok_or_else(|| format!("unparseable year '{year_raw}'"))?;
    let month = u32::try_from(month).map_err(|_| format!("month out of range '{month_raw}'"))?;
    let year = i32::try_from(year).map_err(|_| format!("year out of range '{year_raw}'"))?;
    Competence::new(month, year).map_err(|e| e.to_string())
}

fn build_record(
    mapping: &ColumnMapping,
    row: &RawRecord,
    competence: Option<Competence>,
    file: &str,
) -> std::result::Result<PaymentRecord, String> {
    let amount_raw = cell(mapping, row, CanonicalField::Amount);
    let amount = parse_amount(amount_raw).ok_or_else(|| format!("unparseable amount '{amount_raw}'"))?;
    if amount.is_sign_negative() {
        return Err(format!("negative amount '{amount_raw}'"));
    }
    let competence = match competence {
        Some(c) => c,
        None => row_competence(mapping, row)?,
    };
    let cpf_original = cell(mapping, row, CanonicalField::Cpf).to_string();
    let project = cell(mapping, row, CanonicalField::Project);
    Ok(PaymentRecord {
        id: None,
        cpf: normalize_cpf(&cpf_original),
        cpf_original,
        card_number: normalize_card(cell(mapping, row, CanonicalField::CardNumber)),
        name: cell(mapping, row, CanonicalField::Name)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "),
        amount,
        competence,
        project: (!project.is_empty()).then(|| project.to_string()),
        source_file: file.to_string(),
        row_index: row.line,
        flags: Default::default(),
    })
}

fn rejection(record: &PaymentRecord) -> Option<RejectedRow> {
    let missing = validator::missing_flags(record);
    if missing.is_empty() {
        return None;
    }
    let mut reasons = Vec::new();
    if missing.contains(AnomalyFlag::MissingCpf) {
        let problem = cpf_problem(&record.cpf_original, &record.cpf).unwrap_or_default();
        reasons.push(format!("{}: {problem}", AnomalyFlag::MissingCpf.code()));
    }
    if missing.contains(AnomalyFlag::MissingCard) {
        reasons.push(AnomalyFlag::MissingCard.code().to_string());
    }
    Some(RejectedRow {
        line: record.row_index,
        competence: record.competence,
        cpf_original: record.cpf_original.clone(),
        cpf: record.cpf.clone(),
        card_number: record.card_number.clone(),
        name: record.name.clone(),
        reasons,
    })
}

// ---------------------------------------------------------------------------
// import_file
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ImportResult {
    pub import_id: i64,
    pub imported: usize,
    pub dropped: Vec<DroppedRow>,
    pub rejected: usize,
    pub unparseable: usize,
    pub cells_cleaned: usize,
    pub unmapped: Vec<String>,
    /// Flag counts over the newly imported records.
    pub flag_counts: BTreeMap<AnomalyFlag, usize>,
    pub flagged: usize,
    /// Stored records whose flags changed because of this batch.
    pub reflagged: usize,
    pub duplicate_file: bool,
}

/// Normalize, sanitize, validate and persist one spreadsheet. Fatal
/// problems abort before anything is written.
pub fn import_file(
    conn: &Connection,
    file_path: &Path,
    competence: Option<Competence>,
    actor: &str,
    settings: &Settings,
) -> Result<ImportResult> {
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();
    let data = std::fs::read(file_path).map_err(|e| unreadable(file_path, e))?;

    let checksum = compute_checksum(&data);
    {
        let mut stmt = conn.prepare("SELECT 1 FROM imports WHERE checksum = ?1")?;
        if stmt.exists([&checksum])? {
            tracing::info!(file = %file_name, "file already imported");
            return Ok(ImportResult {
                duplicate_file: true,
                ..Default::default()
            });
        }
    }

    let sheet = read_sheet(file_path, &data)?;
    let table = SynonymTable::with_extra(&settings.column_synonyms);
    let mapping = map_headers(&table, &sheet.headers, &file_name)?;
    for field in REQUIRED_FIELDS {
        if !mapping.has(*field) {
            return Err(MalhaError::MissingColumn {
                file: file_name,
                column: field.name().to_string(),
            });
        }
    }
    if competence.is_none() && !(mapping.has(CanonicalField::Month) && mapping.has(CanonicalField::Year)) {
        return Err(MalhaError::MissingCompetence { file: file_name });
    }
    let unmapped: Vec<String> = mapping.unmapped().into_iter().map(str::to_string).collect();
    if !unmapped.is_empty() {
        tracing::info!(file = %file_name, columns = %unmapped.join(", "), "unmapped columns");
    }

    let mut entries: Vec<AuditLogEntry> = Vec::new();
    let sanitizer = Sanitizer::new(&mapping, &settings.footer_keywords);
    let sanitized = sanitizer.run(sheet.rows, &file_name, actor, &mut entries);

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut unparseable = 0usize;
    for row in &sanitized.kept {
        let record = match build_record(&mapping, row, competence, &file_name) {
            Ok(r) => r,
            Err(reason) => {
                tracing::warn!(file = %file_name, line = row.line, %reason, "skipping row");
                entries.emit(AuditLogEntry::now(
                    actor,
                    AuditAction::RowUnparseable,
                    format!("{file_name}#{}", row.line),
                    format!("{reason}: {}", row.describe()),
                ));
                unparseable += 1;
                continue;
            }
        };
        match rejection(&record) {
            Some(rej) => {
                entries.emit(AuditLogEntry::now(
                    actor,
                    AuditAction::RecordRejected,
                    format!("{file_name}#{}", rej.line),
                    rej.reasons.join("; "),
                ));
                rejected.push(rej);
            }
            None => accepted.push(record),
        }
    }
    if accepted.is_empty() {
        return Err(MalhaError::EmptyBatch { file: file_name });
    }

    // validate together with the stored history
    let mut records = db::load_payments(conn)?;
    let stored = records.len();
    let imported = accepted.len();
    records.extend(accepted);
    let outcome = validator::apply(&mut records, settings.duplicate_policy, actor, &mut entries);

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO imports (filename, imported_by, record_count, dropped_count, rejected_count, checksum) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            file_name,
            actor,
            imported as i64,
            sanitized.dropped.len() as i64,
            rejected.len() as i64,
            checksum,
        ],
    )?;
    let import_id = tx.last_insert_rowid();

    let mut reflagged = 0usize;
    for &i in outcome.changed.iter().filter(|&&i| i < stored) {
        if let Some(id) = records[i].id {
            db::update_flags(&tx, id, &records[i].flags)?;
            reflagged += 1;
        }
    }
    let mut flag_counts: BTreeMap<AnomalyFlag, usize> = BTreeMap::new();
    let mut flagged = 0usize;
    for record in records[stored..].iter_mut() {
        record.id = Some(db::insert_payment(&tx, import_id, record)?);
        if !record.flags.is_empty() {
            flagged += 1;
        }
        for flag in record.flags.iter() {
            *flag_counts.entry(*flag).or_default() += 1;
        }
    }
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO rejected_rows (import_id, line, competence_month, competence_year, \
             cpf_original, cpf, card_number, name, reasons) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for r in &rejected {
            stmt.execute(rusqlite::params![
                import_id,
                r.line as i64,
                r.competence.month,
                r.competence.year,
                r.cpf_original,
                r.cpf,
                r.card_number,
                r.name,
                r.reasons.join("; "),
            ])?;
        }
    }
    entries.emit(AuditLogEntry::now(
        actor,
        AuditAction::ImportCompleted,
        format!("import:{import_id}"),
        format!(
            "{file_name}: {imported} imported, {} dropped, {} rejected, {unparseable} unparseable",
            sanitized.dropped.len(),
            rejected.len()
        ),
    ));
    audit::persist(&tx, &entries)?;
    tx.commit()?;

    tracing::info!(
        file = %file_name,
        imported,
        flagged,
        rejected = rejected.len(),
        dropped = sanitized.dropped.len(),
        "import finished"
    );

    Ok(ImportResult {
        import_id,
        imported,
        dropped: sanitized.dropped,
        rejected: rejected.len(),
        unparseable,
        cells_cleaned: sanitized.cells_cleaned,
        unmapped,
        flag_counts,
        flagged,
        reflagged,
        duplicate_file: false,
    })
}

// ---------------------------------------------------------------------------
// revalidate
// ---------------------------------------------------------------------------

/// Re-run the Malha Fina over every stored record and write back changed
/// flags. The caller owns the transaction and flushes `sink`.
pub fn revalidate_stored(
    conn: &Connection,
    actor: &str,
    policy: DuplicatePolicy,
    sink: &mut dyn AuditSink,
) -> Result<ValidationOutcome> {
    let mut records = db::load_payments(conn)?;
    let outcome = validator::apply(&mut records, policy, actor, sink);
    for &i in &outcome.changed {
        if let Some(id) = records[i].id {
            db::update_flags(conn, id, &records[i].flags)?;
        }
    }
    tracing::info!(records = records.len(), changed = outcome.changed.len(), "validation finished");
    Ok(outcome)
}

/// Counts in the returned outcome cover all periods.
pub fn revalidate(conn: &Connection, actor: &str, policy: DuplicatePolicy) -> Result<ValidationOutcome> {
    let mut entries: Vec<AuditLogEntry> = Vec::new();
    let tx = conn.unchecked_transaction()?;
    let outcome = revalidate_stored(&tx, actor, policy, &mut entries)?;
    audit::persist(&tx, &entries)?;
    tx.commit()?;
    Ok(outcome)
}
