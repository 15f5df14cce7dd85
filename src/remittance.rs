//! Positional remittance ("remessa") file for re-submission to the bank.

use std::path::Path;

use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::db;
use crate::error::{MalhaError, Result};
use crate::layout::{self, remittance};
use crate::models::{Competence, PaymentRecord};
use crate::text::to_bank_ascii;

const LABEL: &str = "REMESSA POT";

pub struct Remittance {
    pub content: String,
    pub included: usize,
    /// (payment id, reason) for every record left out.
    pub excluded: Vec<(Option<i64>, String)>,
    pub total: Decimal,
}

fn cents(amount: Decimal) -> Result<i64> {
    if amount.is_sign_negative() {
        return Err(MalhaError::InvalidAmount(amount.to_string()));
    }
    (amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| MalhaError::InvalidAmount(amount.to_string()))
}

fn exclusion(p: &PaymentRecord) -> Option<String> {
    if p.flags.is_blocking() {
        return Some(format!("flagged {}", p.flags.to_codes()));
    }
    if p.cpf.len() != 11 {
        return Some(format!("cpf '{}' is not 11 digits", p.cpf));
    }
    if p.card_number.is_empty() {
        return Some("no card number".to_string());
    }
    None
}

/// Render the file for `competence`. Records carrying a blocking flag stay out.
pub fn build(records: &[PaymentRecord], competence: Competence, generated_on: NaiveDate) -> Result<Remittance> {
    let packed = competence.packed();
    let date = generated_on.format("%Y%m%d").to_string();
    let mut lines = vec![layout::render(remittance::HEADER, &["0", LABEL, &date, &packed])?];

    let mut total_cents: i64 = 0;
    let mut excluded = Vec::new();
    for p in records.iter().filter(|p| p.competence == competence) {
        if let Some(reason) = exclusion(p) {
            tracing::debug!(cpf = %p.cpf, %reason, "left out of remittance");
            excluded.push((p.id, reason));
            continue;
        }
        let amount_cents = cents(p.amount)?;
        let name = to_bank_ascii(&p.name);
        lines.push(layout::render(
            remittance::DETAIL,
            &["1", &p.cpf, &name, &p.card_number, &amount_cents.to_string(), &packed],
        )?);
        total_cents += amount_cents;
    }

    let included = lines.len() - 1;
    lines.push(layout::render(
        remittance::TRAILER,
        &["9", &included.to_string(), &total_cents.to_string()],
    )?);

    let mut content = lines.join("\r\n");
    content.push_str("\r\n");
    Ok(Remittance {
        content,
        included,
        excluded,
        total: Decimal::new(total_cents, 2),
    })
}

pub fn write(conn: &Connection, competence: Competence, output: &Path) -> Result<Remittance> {
    let records = db::load_payments_for(conn, competence)?;
    let remittance = build(&records, competence, chrono::Local::now().date_naive())?;
    std::fs::write(output, remittance.content.as_bytes())?;
    tracing::info!(
        file = %output.display(),
        included = remittance.included,
        excluded = remittance.excluded.len(),
        "remittance written"
    );
    Ok(remittance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LINE_WIDTH;
    use crate::models::{AnomalyFlag, FlagSet};

    fn march() -> Competence {
        Competence::new(3, 2025).unwrap()
    }

    fn payment(cpf: &str, name: &str, cents: i64) -> PaymentRecord {
        PaymentRecord {
            id: Some(1),
            cpf: cpf.to_string(),
            cpf_original: cpf.to_string(),
            card_number: "4455".to_string(),
            name: name.to_string(),
            amount: Decimal::new(cents, 2),
            competence: march(),
            project: None,
            source_file: "folha.csv".to_string(),
            row_index: 2,
            flags: FlagSet::default(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, 2).unwrap()
    }

    #[test]
    fn test_layout_of_every_line() {
        let records = vec![
            payment("12345678900", "João da Silva", 120000),
            payment("98765432100", "Ana", 35050),
        ];
        let r = build(&records, march(), date()).unwrap();
        let lines: Vec<&str> = r.content.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.len() == LINE_WIDTH));
        assert!(r.content.ends_with("\r\n"));

        assert_eq!(&lines[0][..35], "0REMESSA POT         20250402032025");
        assert_eq!(&lines[1][..12], "112345678900");
        assert_eq!(lines[1][12..52].trim_end(), "JOAO DA SILVA");
        assert_eq!(&lines[1][52..72], "00000000000000004455");
        assert_eq!(&lines[1][72..87], "000000000120000");
        assert_eq!(&lines[1][87..93], "032025");
        assert_eq!(&lines[3][..24], "900000200000000000155050");
        assert_eq!(r.total, Decimal::new(155050, 2));
    }

    #[test]
    fn test_blocking_flags_excluded() {
        let mut dup = payment("11111111111", "Caio", 1000);
        dup.flags.insert(AnomalyFlag::DuplicateInvalid);
        let mut recurring = payment("22222222222", "Davi", 1000);
        recurring.flags.insert(AnomalyFlag::DuplicateRecurring);
        let r = build(&[dup, recurring], march(), date()).unwrap();
        assert_eq!(r.included, 1);
        assert_eq!(r.excluded.len(), 1);
        assert!(r.excluded[0].1.contains("DUPLICATE_INVALID"));
    }

    #[test]
    fn test_other_competence_ignored() {
        let mut april = payment("12345678900", "Ana", 1000);
        april.competence = Competence::new(4, 2025).unwrap();
        let r = build(&[april], march(), date()).unwrap();
        assert_eq!(r.included, 0);
        assert!(r.content.contains("9000000"));
    }

    #[test]
    fn test_half_cents_round_away_from_zero() {
        let mut a = payment("12345678900", "Ana", 0);
        a.amount = Decimal::new(10005, 3);
        let mut b = payment("98765432100", "Bia", 0);
        b.amount = Decimal::new(20025, 3);
        let r = build(&[a, b], march(), date()).unwrap();
        let lines: Vec<&str> = r.content.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(&lines[1][72..87], "000000000001001");
        assert_eq!(&lines[2][72..87], "000000000002003");
        assert_eq!(&lines[3][..24], "900000200000000000003004");
        assert_eq!(r.total, Decimal::new(3004, 2));
    }

    #[test]
    fn test_negative_amount_is_error() {
        let r = build(&[payment("12345678900", "Ana", -100)], march(), date());
        assert!(matches!(r, Err(MalhaError::InvalidAmount(_))));
    }
}
