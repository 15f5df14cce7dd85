use std::path::PathBuf;

use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::cli::open_session;
use crate::error::Result;
use crate::models::{Competence, DivergenceType};
use crate::permissions::Capability;
use crate::reconciler::{reconcile, ReconcileResult, RunStatus};

const KINDS: &[DivergenceType] = &[
    DivergenceType::MissingInBank,
    DivergenceType::MissingInSystem,
    DivergenceType::NameMismatch,
    DivergenceType::CardMismatch,
    DivergenceType::ParseError,
];

pub fn run(user: Option<&str>, file: &str, competence: &str) -> Result<()> {
    let session = open_session(user)?;
    let competence = Competence::parse(competence)?;
    session
        .actor
        .require(&session.conn, Capability::Reconcile, &format!("bank_file:{file}"))?;

    let result = reconcile(&session.conn, &PathBuf::from(file), competence, &session.actor.name)?;
    println!("{}", format_result(&result, competence));
    Ok(())
}

pub fn format_result(r: &ReconcileResult, competence: Competence) -> String {
    let status = match r.status {
        RunStatus::Completed => r.status.code().green().to_string(),
        _ => r.status.code().yellow().to_string(),
    };
    let mut out = format!(
        "Run {} for {competence}: {status}\n{} bank records, {} system cpfs, {} matched",
        r.run_id, r.bank_records, r.system_cpfs, r.matched
    );
    if r.divergences.is_empty() {
        out.push_str(&format!("\n{}", "No divergences.".green()));
        return out;
    }
    let mut table = Table::new();
    table.set_header(vec!["Divergence", "Count"]);
    for kind in KINDS {
        let n = r.count(*kind);
        if n > 0 {
            table.add_row(vec![Cell::new(kind.code()), Cell::new(n)]);
        }
    }
    out.push_str(&format!("\n{table}\nSee `malha report divergences --run {}`.", r.run_id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DivergenceRecord;

    #[test]
    fn test_format_counts_by_kind() {
        colored::control::set_override(false);
        let r = ReconcileResult {
            run_id: 3,
            status: RunStatus::CompletedWithErrors,
            matched: 98,
            bank_records: 99,
            system_cpfs: 100,
            divergences: vec![
                DivergenceRecord {
                    cpf: String::new(),
                    system_name: None,
                    bank_name: None,
                    divergence_type: DivergenceType::ParseError,
                    detail: "line 7: short line".to_string(),
                },
                DivergenceRecord {
                    cpf: "12345678900".to_string(),
                    system_name: Some("ANA".to_string()),
                    bank_name: None,
                    divergence_type: DivergenceType::MissingInBank,
                    detail: String::new(),
                },
            ],
        };
        let out = format_result(&r, Competence::new(3, 2025).unwrap());
        assert!(out.starts_with("Run 3 for 03/2025: COMPLETED_WITH_ERRORS"));
        assert!(out.contains("99 bank records, 100 system cpfs, 98 matched"));
        assert!(out.contains("PARSE_ERROR"));
        assert!(out.contains("MISSING_IN_BANK"));
        assert!(!out.contains("CARD_MISMATCH"));
    }
}
