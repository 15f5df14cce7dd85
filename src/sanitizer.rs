//! Row sanitizer: drops footer/total rows and scrubs characters the bank
//! layout cannot carry.
//!
//! Dropping rows is lossy, so every dropped row is emitted to the audit sink
//! with its original content.

use crate::audit::{AuditAction, AuditLogEntry, AuditSink};
use crate::columns::{CanonicalField, ColumnMapping};
use crate::models::RawRecord;
use crate::text::{clean_cell, digits_only, normalize_key};

pub const FOOTER_KEYWORDS: &[&str] = &["total", "subtotal", "sub total", "total geral", "totais", "soma"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Blank,
    FooterKeyword,
    TotalsRow,
}

impl DropReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Blank => "blank row",
            Self::FooterKeyword => "footer keyword",
            Self::TotalsRow => "amount without identifiers",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DroppedRow {
    pub line: usize,
    pub reason: DropReason,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct SanitizeOutcome {
    pub kept: Vec<RawRecord>,
    pub dropped: Vec<DroppedRow>,
    pub cells_cleaned: usize,
}

pub struct Sanitizer<'a> {
    mapping: &'a ColumnMapping,
    keywords: Vec<String>,
}

impl<'a> Sanitizer<'a> {
    pub fn new(mapping: &'a ColumnMapping, extra_keywords: &[String]) -> Self {
        let keywords = FOOTER_KEYWORDS
            .iter()
            .map(|k| normalize_key(k))
            .chain(extra_keywords.iter().map(|k| normalize_key(k)))
            .filter(|k| !k.is_empty())
            .collect();
        Self { mapping, keywords }
    }

    fn cell<'r>(&self, row: &'r RawRecord, field: CanonicalField) -> &'r str {
        self.mapping
            .index_of(field)
            .and_then(|i| row.cells.get(i))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    fn starts_with_keyword(&self, first_cell: &str) -> bool {
        let key = normalize_key(first_cell);
        self.keywords
            .iter()
            .any(|k| key == *k || key.strip_prefix(k.as_str()).is_some_and(|rest| rest.starts_with(' ')))
    }

    /// Why `row` is not a data row, if it is not.
    pub fn classify(&self, row: &RawRecord) -> Option<DropReason> {
        if row.is_blank() {
            return Some(DropReason::Blank);
        }
        if self.starts_with_keyword(row.first_cell()) {
            return Some(DropReason::FooterKeyword);
        }
        let no_cpf = digits_only(self.cell(row, CanonicalField::Cpf)).is_empty();
        let no_card = digits_only(self.cell(row, CanonicalField::CardNumber)).is_empty();
        let has_amount = !self.cell(row, CanonicalField::Amount).trim().is_empty();
        if no_cpf && no_card && has_amount {
            return Some(DropReason::TotalsRow);
        }
        None
    }

    pub fn run(
        &self,
        rows: Vec<RawRecord>,
        file: &str,
        actor: &str,
        sink: &mut dyn AuditSink,
    ) -> SanitizeOutcome {
        let mut outcome = SanitizeOutcome::default();
        for mut row in rows {
            if let Some(reason) = self.classify(&row) {
                let content = row.describe();
                tracing::info!(file, line = row.line, reason = reason.describe(), "dropping row");
                sink.emit(AuditLogEntry::now(
                    actor,
                    AuditAction::RowDropped,
                    format!("{file}#{}", row.line),
                    format!("{}: {content}", reason.describe()),
                ));
                outcome.dropped.push(DroppedRow {
                    line: row.line,
                    reason,
                    content,
                });
                continue;
            }
            for (_, value) in row.cells.iter_mut() {
                let cleaned = clean_cell(value);
                if cleaned != value.trim() {
                    outcome.cells_cleaned += 1;
                }
                *value = cleaned;
            }
            outcome.kept.push(row);
        }
        outcome
    }
}
