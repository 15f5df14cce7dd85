use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{MalhaError, Result};

/// The (month, year) a payment batch pertains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Competence {
    pub year: i32,
    pub month: u32,
}

impl Competence {
    pub fn new(month: u32, year: i32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1900..=2999).contains(&year) {
            return Err(MalhaError::InvalidCompetence(format!("{month:02}/{year}")));
        }
        Ok(Self { year, month })
    }

    /// Accepts `YYYY-MM`, `MM/YYYY` and `MM-YYYY`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || MalhaError::InvalidCompetence(raw.to_string());
        let parts: Vec<&str> = raw.split(['-', '/']).collect();
        if parts.len() != 2 {
            return Err(invalid());
        }
        let (month, year) = if parts[0].len() == 4 {
            (parts[1], parts[0])
        } else {
            (parts[0], parts[1])
        };
        let month: u32 = month.trim().parse().map_err(|_| invalid())?;
        let year: i32 = year.trim().parse().map_err(|_| invalid())?;
        Self::new(month, year).map_err(|_| invalid())
    }

    /// `MMYYYY`, as written into positional bank files.
    pub fn packed(&self) -> String {
        format!("{:02}{:04}", self.month, self.year)
    }
}

impl fmt::Display for Competence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{}", self.month, self.year)
    }
}

/// A spreadsheet row before any interpretation.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// 1-based line in the source file, header included.
    pub line: usize,
    pub cells: Vec<(String, String)>,
}

impl RawRecord {
    pub fn first_cell(&self) -> &str {
        self.cells.first().map(|(_, v)| v.as_str()).unwrap_or("")
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, v)| v.trim().is_empty())
    }

    /// Original content for audit trails: `header=value` pairs.
    pub fn describe(&self) -> String {
        self.cells
            .iter()
            .map(|(h, v)| format!("{h}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AnomalyFlag {
    MissingCpf,
    MissingCard,
    CpfNameConflict,
    CpfCardConflict,
    CardMultiCpf,
    DuplicateRecurring,
    DuplicateInvalid,
}

pub const ALL_FLAGS: &[AnomalyFlag] = &[
    AnomalyFlag::MissingCpf,
    AnomalyFlag::MissingCard,
    AnomalyFlag::CpfNameConflict,
    AnomalyFlag::CpfCardConflict,
    AnomalyFlag::CardMultiCpf,
    AnomalyFlag::DuplicateRecurring,
    AnomalyFlag::DuplicateInvalid,
];

impl AnomalyFlag {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCpf => "MISSING_CPF",
            Self::MissingCard => "MISSING_CARD",
            Self::CpfNameConflict => "CPF_NAME_CONFLICT",
            Self::CpfCardConflict => "CPF_CARD_CONFLICT",
            Self::CardMultiCpf => "CARD_MULTI_CPF",
            Self::DuplicateRecurring => "DUPLICATE_RECURRING",
            Self::DuplicateInvalid => "DUPLICATE_INVALID",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        ALL_FLAGS.iter().find(|f| f.code() == code).copied()
    }

    /// Recurring duplicates are legitimate monthly payments; everything else
    /// keeps the record out of the remittance file until corrected.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::DuplicateRecurring)
    }
}

/// Sorted, de-duplicated flag set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlagSet(Vec<AnomalyFlag>);

impl FlagSet {
    pub fn insert(&mut self, flag: AnomalyFlag) {
        if let Err(pos) = self.0.binary_search(&flag) {
            self.0.insert(pos, flag);
        }
    }

    pub fn contains(&self, flag: AnomalyFlag) -> bool {
        self.0.binary_search(&flag).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_blocking(&self) -> bool {
        self.0.iter().any(AnomalyFlag::is_blocking)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnomalyFlag> {
        self.0.iter()
    }

    /// Comma-separated codes, the form stored in the database.
    pub fn to_codes(&self) -> String {
        self.0.iter().map(AnomalyFlag::code).collect::<Vec<_>>().join(",")
    }

    pub fn from_codes(codes: &str) -> Self {
        let mut set = Self::default();
        for code in codes.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            if let Some(flag) = AnomalyFlag::from_code(code) {
                set.insert(flag);
            }
        }
        set
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRecord {
    /// `None` until persisted.
    pub id: Option<i64>,
    pub cpf: String,
    pub cpf_original: String,
    pub card_number: String,
    pub name: String,
    pub amount: Decimal,
    pub competence: Competence,
    pub project: Option<String>,
    pub source_file: String,
    pub row_index: usize,
    pub flags: FlagSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankReturnRecord {
    pub cpf: String,
    pub name: String,
    pub card_number: String,
    pub line_number: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DivergenceType {
    MissingInBank,
    MissingInSystem,
    NameMismatch,
    CardMismatch,
    ParseError,
}

impl DivergenceType {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingInBank => "MISSING_IN_BANK",
            Self::MissingInSystem => "MISSING_IN_SYSTEM",
            Self::NameMismatch => "NAME_MISMATCH",
            Self::CardMismatch => "CARD_MISMATCH",
            Self::ParseError => "PARSE_ERROR",
        }
    }
}

impl FromStr for DivergenceType {
    type Err = MalhaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MISSING_IN_BANK" => Ok(Self::MissingInBank),
            "MISSING_IN_SYSTEM" => Ok(Self::MissingInSystem),
            "NAME_MISMATCH" => Ok(Self::NameMismatch),
            "CARD_MISMATCH" => Ok(Self::CardMismatch),
            "PARSE_ERROR" => Ok(Self::ParseError),
            other => Err(MalhaError::Other(format!("unknown divergence type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceRecord {
    pub cpf: String,
    pub system_name: Option<String>,
    pub bank_name: Option<String>,
    pub divergence_type: DivergenceType,
    pub detail: String,
}

/// One row that could not become a PaymentRecord.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    pub line: usize,
    pub competence: Competence,
    pub cpf_original: String,
    pub cpf: String,
    pub card_number: String,
    pub name: String,
    pub reasons: Vec<String>,
}
