use std::path::PathBuf;

use colored::Colorize;

use crate::cli::{open_session, parse_competence_opt};
use crate::error::Result;
use crate::importer::{import_file, ImportResult};
use crate::permissions::Capability;

pub fn run(user: Option<&str>, file: &str, competence: Option<String>) -> Result<()> {
    let session = open_session(user)?;
    let competence = parse_competence_opt(&competence)?;
    let file_path = PathBuf::from(file);
    session
        .actor
        .require(&session.conn, Capability::Import, &format!("file:{file}"))?;

    let result = import_file(
        &session.conn,
        &file_path,
        competence,
        &session.actor.name,
        &session.settings,
    )?;

    if result.duplicate_file {
        println!("This file has already been imported (duplicate checksum).");
        return Ok(());
    }
    println!("{}", format_result(&result));
    Ok(())
}

pub fn format_result(r: &ImportResult) -> String {
    let mut out = format!(
        "Import #{}: {} imported, {} dropped, {} rejected, {} unparseable",
        r.import_id,
        r.imported,
        r.dropped.len(),
        r.rejected,
        r.unparseable
    );
    for d in &r.dropped {
        out.push_str(&format!("\n  line {:<5} {:<26} {}", d.line, d.reason.describe(), d.content));
    }
    if r.cells_cleaned > 0 {
        out.push_str(&format!("\n{} cells cleaned", r.cells_cleaned));
    }
    if !r.unmapped.is_empty() {
        out.push_str(&format!("\nIgnored columns: {}", r.unmapped.join(", ")));
    }
    if r.flagged == 0 {
        out.push_str(&format!("\n{}", "No anomalies found.".green()));
    } else {
        out.push_str(&format!("\n{}", format!("{} records flagged", r.flagged).yellow()));
        for (flag, n) in &r.flag_counts {
            out.push_str(&format!("\n  {:<22} {n}", flag.code()));
        }
    }
    if r.reflagged > 0 {
        out.push_str(&format!("\n{} previously stored records changed flags", r.reflagged));
    }
    if r.rejected > 0 {
        out.push_str("\nSee `malha report cpf-problems` for rejected rows.");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnomalyFlag;
    use crate::sanitizer::{DropReason, DroppedRow};
    use std::collections::BTreeMap;

    fn result() -> ImportResult {
        ImportResult {
            import_id: 1,
            imported: 5,
            dropped: vec![
                DroppedRow {
                    line: 9,
                    reason: DropReason::FooterKeyword,
                    content: "CPF=TOTAL; Valor=1.000,00".to_string(),
                },
                DroppedRow {
                    line: 10,
                    reason: DropReason::Blank,
                    content: String::new(),
                },
            ],
            rejected: 1,
            unparseable: 0,
            cells_cleaned: 3,
            unmapped: vec!["obs".to_string()],
            flag_counts: BTreeMap::new(),
            flagged: 0,
            reflagged: 0,
            duplicate_file: false,
        }
    }

    #[test]
    fn test_format_clean_import() {
        colored::control::set_override(false);
        let out = format_result(&result());
        assert!(out.starts_with("Import #1: 5 imported, 2 dropped, 1 rejected, 0 unparseable"));
        assert!(out.contains("line 9"));
        assert!(out.contains("footer keyword"));
        assert!(out.contains("CPF=TOTAL; Valor=1.000,00"));
        assert!(out.contains("3 cells cleaned"));
        assert!(out.contains("Ignored columns: obs"));
        assert!(out.contains("No anomalies found."));
        assert!(out.contains("cpf-problems"));
    }

    #[test]
    fn test_format_lists_flags() {
        colored::control::set_override(false);
        let mut r = result();
        r.flagged = 2;
        r.flag_counts.insert(AnomalyFlag::DuplicateInvalid, 2);
        let out = format_result(&r);
        assert!(out.contains("2 records flagged"));
        assert!(out.contains("DUPLICATE_INVALID"));
    }
}
