//! CSV exports. Files are `;`-delimited so spreadsheet tools configured for
//! pt-BR open them without an import wizard.

use std::io::Write;

use rust_decimal::RoundingStrategy;
use serde::Serialize;

use crate::error::Result;
use crate::models::PaymentRecord;
use crate::reconciler::StoredDivergence;
use crate::reports::CpfProblemRow;

fn writer<W: Write>(w: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b';').from_writer(w)
}

#[derive(Serialize)]
struct PaymentLine<'a> {
    id: Option<i64>,
    competencia: String,
    cpf: &'a str,
    num_cartao: &'a str,
    nome: &'a str,
    valor: String,
    projeto: &'a str,
    arquivo: &'a str,
    linha: usize,
    flags: String,
}

pub fn write_payments<W: Write>(w: W, records: &[PaymentRecord]) -> Result<usize> {
    let mut wtr = writer(w);
    for p in records {
        wtr.serialize(PaymentLine {
            id: p.id,
            competencia: p.competence.to_string(),
            cpf: &p.cpf,
            num_cartao: &p.card_number,
            nome: &p.name,
            valor: p
                .amount
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
                .to_string(),
            projeto: p.project.as_deref().unwrap_or(""),
            arquivo: &p.source_file,
            linha: p.row_index,
            flags: p.flags.to_codes(),
        })?;
    }
    wtr.flush()?;
    Ok(records.len())
}

#[derive(Serialize)]
struct DivergenceLine<'a> {
    run: i64,
    cpf: &'a str,
    tipo: &'a str,
    nome_sistema: &'a str,
    nome_banco: &'a str,
    detalhe: &'a str,
}

pub fn write_divergences<W: Write>(w: W, divergences: &[StoredDivergence]) -> Result<usize> {
    let mut wtr = writer(w);
    for d in divergences {
        wtr.serialize(DivergenceLine {
            run: d.run_id,
            cpf: &d.record.cpf,
            tipo: d.record.divergence_type.code(),
            nome_sistema: d.record.system_name.as_deref().unwrap_or(""),
            nome_banco: d.record.bank_name.as_deref().unwrap_or(""),
            detalhe: &d.record.detail,
        })?;
    }
    wtr.flush()?;
    Ok(divergences.len())
}

#[derive(Serialize)]
struct AdjustmentLine<'a> {
    situacao: &'a str,
    arquivo: &'a str,
    linha: i64,
    cpf_original: &'a str,
    cpf_processado: &'a str,
    alterado: bool,
    num_cartao: &'a str,
    nome: &'a str,
    problema: &'a str,
}

/// Original against processed cpf for every stored record, then every
/// rejected row with its problem.
pub fn write_adjustments<W: Write>(w: W, records: &[PaymentRecord], rejected: &[CpfProblemRow]) -> Result<usize> {
    let mut wtr = writer(w);
    let mut changed = 0usize;
    for p in records {
        let altered = p.cpf_original.trim() != p.cpf;
        if altered {
            changed += 1;
        }
        wtr.serialize(AdjustmentLine {
            situacao: "importado",
            arquivo: &p.source_file,
            linha: p.row_index as i64,
            cpf_original: &p.cpf_original,
            cpf_processado: &p.cpf,
            alterado: altered,
            num_cartao: &p.card_number,
            nome: &p.name,
            problema: "",
        })?;
    }
    for r in rejected {
        wtr.serialize(AdjustmentLine {
            situacao: "rejeitado",
            arquivo: &r.filename,
            linha: r.line,
            cpf_original: &r.cpf_original,
            cpf_processado: &r.cpf,
            alterado: r.cpf_original.trim() != r.cpf,
            num_cartao: &r.card_number,
            nome: &r.name,
            problema: &r.problem,
        })?;
    }
    wtr.flush()?;
    tracing::debug!(changed, rejected = rejected.len(), "adjustments written");
    Ok(records.len() + rejected.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnomalyFlag, Competence, DivergenceRecord, DivergenceType, FlagSet};
    use rust_decimal::Decimal;

    fn payment() -> PaymentRecord {
        let mut flags = FlagSet::default();
        flags.insert(AnomalyFlag::DuplicateInvalid);
        PaymentRecord {
            id: Some(7),
            cpf: "01234567890".to_string(),
            cpf_original: "123.456.789-0".to_string(),
            card_number: "4455".to_string(),
            name: "Ana; Lima".to_string(),
            amount: Decimal::new(12000, 2),
            competence: Competence::new(3, 2025).unwrap(),
            project: None,
            source_file: "folha.csv".to_string(),
            row_index: 4,
            flags,
        }
    }

    #[test]
    fn test_payments_csv() {
        let mut out = Vec::new();
        assert_eq!(write_payments(&mut out, &[payment()]).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id;competencia;cpf;num_cartao;nome;valor;projeto;arquivo;linha;flags"
        );
        assert_eq!(
            lines.next().unwrap(),
            "7;03/2025;01234567890;4455;\"Ana; Lima\";120.00;;folha.csv;4;DUPLICATE_INVALID"
        );
    }

    #[test]
    fn test_divergences_csv() {
        let d = StoredDivergence {
            run_id: 3,
            record: DivergenceRecord {
                cpf: "12345678900".to_string(),
                system_name: Some("JOÃO DA SILVA".to_string()),
                bank_name: Some("JOAO SILVA".to_string()),
                divergence_type: DivergenceType::NameMismatch,
                detail: "bank line 2".to_string(),
            },
        };
        let mut out = Vec::new();
        write_divergences(&mut out, &[d]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("3;12345678900;NAME_MISMATCH;JOÃO DA SILVA;JOAO SILVA;bank line 2"));
    }

    #[test]
    fn test_adjustments_mark_changed_cpf() {
        let rejected = CpfProblemRow {
            filename: "folha.csv".to_string(),
            line: 9,
            cpf_original: String::new(),
            cpf: String::new(),
            card_number: "1".to_string(),
            name: "Caio".to_string(),
            problem: "empty".to_string(),
        };
        let mut out = Vec::new();
        assert_eq!(write_adjustments(&mut out, &[payment()], &[rejected]).unwrap(), 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[1].starts_with("importado;folha.csv;4;123.456.789-0;01234567890;true"));
        assert!(lines[2].ends_with("false;1;Caio;empty"));
    }
}
