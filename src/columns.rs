//! Column normalizer: maps whatever header a spreadsheet uses onto the
//! canonical payment fields.
//!
//! The synonym table is data. New spellings go into `SYNONYMS` or, without a
//! rebuild, into the `column_synonyms` map of the settings file.

use std::collections::{BTreeMap, HashMap};

use crate::error::{MalhaError, Result};
use crate::text::normalize_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalField {
    Cpf,
    CardNumber,
    Name,
    Amount,
    Month,
    Year,
    Project,
}

pub const ALL_FIELDS: &[CanonicalField] = &[
    CanonicalField::Cpf,
    CanonicalField::CardNumber,
    CanonicalField::Name,
    CanonicalField::Amount,
    CanonicalField::Month,
    CanonicalField::Year,
    CanonicalField::Project,
];

/// Columns an import cannot do without.
pub const REQUIRED_FIELDS: &[CanonicalField] = &[
    CanonicalField::Cpf,
    CanonicalField::CardNumber,
    CanonicalField::Name,
    CanonicalField::Amount,
];

impl CanonicalField {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpf => "cpf",
            Self::CardNumber => "num_cartao",
            Self::Name => "nome",
            Self::Amount => "valor",
            Self::Month => "mes",
            Self::Year => "ano",
            Self::Project => "projeto",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let key = normalize_key(name);
        ALL_FIELDS
            .iter()
            .find(|f| normalize_key(f.name()) == key)
            .copied()
    }
}

// (header spelling, canonical field). Spellings are compared after
// `normalize_key`, so case, accents and punctuation do not matter here.
const SYNONYMS: &[(&str, CanonicalField)] = &[
    ("cpf", CanonicalField::Cpf),
    ("cpf beneficiario", CanonicalField::Cpf),
    ("cpf do beneficiario", CanonicalField::Cpf),
    ("numero cpf", CanonicalField::Cpf),
    ("num cpf", CanonicalField::Cpf),
    ("documento cpf", CanonicalField::Cpf),
    ("num_cartao", CanonicalField::CardNumber),
    ("numcartao", CanonicalField::CardNumber),
    ("cartao", CanonicalField::CardNumber),
    ("codigo", CanonicalField::CardNumber),
    ("numero cartao", CanonicalField::CardNumber),
    ("numero do cartao", CanonicalField::CardNumber),
    ("n cartao", CanonicalField::CardNumber),
    ("conta", CanonicalField::CardNumber),
    ("num conta", CanonicalField::CardNumber),
    ("numero conta", CanonicalField::CardNumber),
    ("numero da conta", CanonicalField::CardNumber),
    ("nome", CanonicalField::Name),
    ("nome beneficiario", CanonicalField::Name),
    ("nome do beneficiario", CanonicalField::Name),
    ("beneficiario", CanonicalField::Name),
    ("favorecido", CanonicalField::Name),
    ("nome completo", CanonicalField::Name),
    ("valor", CanonicalField::Amount),
    ("valor pago", CanonicalField::Amount),
    ("valor pagamento", CanonicalField::Amount),
    ("valor do pagamento", CanonicalField::Amount),
    ("vlr", CanonicalField::Amount),
    ("vlr pagamento", CanonicalField::Amount),
    ("mes", CanonicalField::Month),
    ("mes referencia", CanonicalField::Month),
    ("mes de referencia", CanonicalField::Month),
    ("mes competencia", CanonicalField::Month),
    ("ano", CanonicalField::Year),
    ("ano referencia", CanonicalField::Year),
    ("ano de referencia", CanonicalField::Year),
    ("ano competencia", CanonicalField::Year),
    ("projeto", CanonicalField::Project),
    ("programa", CanonicalField::Project),
    ("frente de trabalho", CanonicalField::Project),
];

#[derive(Debug, Clone)]
pub struct SynonymTable {
    entries: HashMap<String, CanonicalField>,
}

impl Default for SynonymTable {
    fn default() -> Self {
        let entries = SYNONYMS
            .iter()
            .map(|(spelling, field)| (normalize_key(spelling), *field))
            .collect();
        Self { entries }
    }
}

impl SynonymTable {
    /// Built-in table plus the user's additions. Additions naming an
    /// unknown field are ignored with a warning.
    pub fn with_extra(extra: &BTreeMap<String, String>) -> Self {
        let mut table = Self::default();
        for (spelling, field_name) in extra {
            match CanonicalField::from_name(field_name) {
                Some(field) => {
                    table.entries.insert(normalize_key(spelling), field);
                }
                None => tracing::warn!(spelling = %spelling, field = %field_name, "ignoring synonym for unknown field"),
            }
        }
        table
    }

    pub fn lookup(&self, header: &str) -> Option<CanonicalField> {
        self.entries.get(&normalize_key(header)).copied()
    }
}

/// Canonical name for a header, or the header itself when unmapped.
pub fn normalize_header(table: &SynonymTable, header: &str) -> String {
    match table.lookup(header) {
        Some(field) => field.name().to_string(),
        None => header.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnTarget {
    Canonical(CanonicalField),
    Unmapped,
}

#[derive(Debug, Clone)]
pub struct ColumnMapping {
    /// One entry per source column, in file order.
    pub columns: Vec<(String, ColumnTarget)>,
}

impl ColumnMapping {
    /// Position of the column feeding `field`.
    pub fn index_of(&self, field: CanonicalField) -> Option<usize> {
        self.columns
            .iter()
            .position(|(_, t)| *t == ColumnTarget::Canonical(field))
    }

    pub fn has(&self, field: CanonicalField) -> bool {
        self.index_of(field).is_some()
    }

    pub fn unmapped(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, t)| *t == ColumnTarget::Unmapped)
            .map(|(h, _)| h.as_str())
            .collect()
    }
}

/// Map every header. Two headers resolving to the same field make the file
/// ambiguous and fail the whole batch.
pub fn map_headers(table: &SynonymTable, headers: &[String], file: &str) -> Result<ColumnMapping> {
    let mut seen: HashMap<CanonicalField, Vec<&str>> = HashMap::new();
    let mut columns = Vec::with_capacity(headers.len());
    for header in headers {
        tracing::debug!(file, header = %header, mapped = %normalize_header(table, header), "column");
        match table.lookup(header) {
            Some(field) => {
                seen.entry(field).or_default().push(header.as_str());
                columns.push((header.clone(), ColumnTarget::Canonical(field)));
            }
            None => columns.push((header.clone(), ColumnTarget::Unmapped)),
        }
    }
    let mut conflicts: Vec<_> = seen.into_iter().filter(|(_, hs)| hs.len() > 1).collect();
    conflicts.sort_by_key(|(field, _)| *field);
    if let Some((field, hs)) = conflicts.into_iter().next() {
        return Err(MalhaError::ConflictingColumns {
            file: file.to_string(),
            canonical: field.name().to_string(),
            headers: hs.join(", "),
        });
    }
    Ok(ColumnMapping { columns })
}
