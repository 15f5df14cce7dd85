//! Fixed-width record layouts used to talk to the bank.
//!
//! Offsets are byte offsets. Both files are single-byte encoded, so a byte
//! is a column.

use crate::error::{MalhaError, Result};

pub const LINE_WIDTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Right-aligned, zero padded.
    Numeric,
    /// Left-aligned, space padded, truncated when too long.
    Alpha,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub start: usize,
    pub len: usize,
    pub kind: Kind,
}

impl Field {
    pub const fn end(&self) -> usize {
        self.start + self.len
    }
}

const fn num(name: &'static str, start: usize, len: usize) -> Field {
    Field { name, start, len, kind: Kind::Numeric }
}

const fn alpha(name: &'static str, start: usize, len: usize) -> Field {
    Field { name, start, len, kind: Kind::Alpha }
}

pub mod bank_return {
    use super::{alpha, num, Field};

    pub const RECORD_TYPE: Field = alpha("record_type", 0, 1);
    pub const CPF: Field = num("cpf", 1, 11);
    pub const NAME: Field = alpha("name", 12, 40);
    pub const CARD: Field = num("card_number", 52, 20);
    pub const STATUS: Field = alpha("status", 72, 2);
    pub const FILLER: Field = alpha("filler", 74, 26);

    pub const DETAIL: &[Field] = &[RECORD_TYPE, CPF, NAME, CARD, STATUS, FILLER];
}

pub mod remittance {
    use super::{alpha, num, Field};

    pub const HEADER: &[Field] = &[
        alpha("record_type", 0, 1),
        alpha("label", 1, 20),
        num("generated_on", 21, 8),
        num("competence", 29, 6),
        alpha("filler", 35, 65),
    ];

    pub const DETAIL: &[Field] = &[
        alpha("record_type", 0, 1),
        num("cpf", 1, 11),
        alpha("name", 12, 40),
        num("card_number", 52, 20),
        num("amount_cents", 72, 15),
        num("competence", 87, 6),
        alpha("filler", 93, 7),
    ];

    pub const TRAILER: &[Field] = &[
        alpha("record_type", 0, 1),
        num("detail_count", 1, 6),
        num("total_cents", 7, 17),
        alpha("filler", 24, 76),
    ];
}

/// ISO-8859-1 decode: every byte is the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Raw text of `field` in `line`, trimmed.
pub fn slice(line: &[u8], field: &Field) -> Option<String> {
    line.get(field.start..field.end())
        .map(|bytes| decode_latin1(bytes).trim().to_string())
}

fn pad(field: &Field, value: &str) -> Result<String> {
    if !value.is_ascii() {
        return Err(MalhaError::Layout(format!("{}: non-ASCII value '{value}'", field.name)));
    }
    match field.kind {
        Kind::Numeric => {
            if !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MalhaError::Layout(format!("{}: not numeric '{value}'", field.name)));
            }
            if value.len() > field.len {
                return Err(MalhaError::Layout(format!(
                    "{}: '{value}' exceeds {} digits",
                    field.name, field.len
                )));
            }
            Ok(format!("{value:0>width$}", width = field.len))
        }
        Kind::Alpha => {
            let truncated: String = value.chars().take(field.len).collect();
            Ok(format!("{truncated:<width$}", width = field.len))
        }
    }
}

/// Render one line from `(field, value)` pairs in layout order. Missing
/// trailing fields (fillers) are written as blanks.
pub fn render(fields: &[Field], values: &[&str]) -> Result<String> {
    let mut line = String::with_capacity(LINE_WIDTH);
    for (i, field) in fields.iter().enumerate() {
        if line.len() != field.start {
            return Err(MalhaError::Layout(format!("{}: layout gap at {}", field.name, line.len())));
        }
        let value = values.get(i).copied().unwrap_or("");
        line.push_str(&pad(field, value)?);
    }
    if line.len() != LINE_WIDTH {
        return Err(MalhaError::Layout(format!("line is {} bytes, expected {LINE_WIDTH}", line.len())));
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contiguous(fields: &[Field]) {
        let mut at = 0;
        for f in fields {
            assert_eq!(f.start, at, "field {} starts at {}", f.name, f.start);
            at = f.end();
        }
        assert_eq!(at, LINE_WIDTH);
    }

    #[test]
    fn test_layouts_cover_the_line() {
        contiguous(bank_return::DETAIL);
        contiguous(remittance::HEADER);
        contiguous(remittance::DETAIL);
        contiguous(remittance::TRAILER);
    }

    #[test]
    fn test_render_pads_and_aligns() {
        let line = render(remittance::TRAILER, &["9", "3", "150000"]).unwrap();
        assert_eq!(line.len(), LINE_WIDTH);
        assert_eq!(&line[..24], "900000300000000000150000");
        assert!(line[24..].chars().all(|c| c == ' '));
    }

    #[test]
    fn test_render_rejects_overflow() {
        let err = render(remittance::TRAILER, &["9", "1234567", "0"]).unwrap_err();
        assert!(err.to_string().contains("detail_count"));
    }

    #[test]
    fn test_alpha_truncates() {
        let long = "X".repeat(60);
        let line = render(remittance::DETAIL, &["1", "12345678900", &long, "1", "1", "032025"]).unwrap();
        assert_eq!(&line[12..52], "X".repeat(40));
    }

    #[test]
    fn test_slice_latin1() {
        let mut bytes = b"1".to_vec();
        bytes.extend_from_slice(b"12345678900");
        bytes.extend_from_slice(b"JO\xC3O");
        assert_eq!(slice(&bytes, &bank_return::CPF).as_deref(), Some("12345678900"));
        assert_eq!(slice(&bytes, &bank_return::NAME), None);
        assert_eq!(decode_latin1(b"JO\xC3O"), "JOÃO");
    }
}
