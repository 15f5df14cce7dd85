use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::audit::{self, AuditRow};
use crate::cli::{open_session, parse_competence_opt, ReportCommands, Session};
use crate::error::Result;
use crate::fmt::{cpf, money};
use crate::models::Competence;
use crate::permissions::Capability;
use crate::reconciler::{self, RunRow, StoredDivergence};
use crate::reports::{self, CpfProblems, FlaggedRow, ImportRow, Summary};

pub fn dispatch(user: Option<&str>, cmd: ReportCommands) -> Result<()> {
    let session = open_session(user)?;
    let text = render(&session, cmd)?;
    println!("{text}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Data-fetching wrappers
// ---------------------------------------------------------------------------

fn render(session: &Session, cmd: ReportCommands) -> Result<String> {
    let conn = &session.conn;
    let (capability, entity) = match &cmd {
        ReportCommands::Audit { .. } => (Capability::ViewAuditLog, "audit_log"),
        _ => (Capability::ViewReports, "reports"),
    };
    session.actor.require(conn, capability, entity)?;
    match cmd {
        ReportCommands::Summary { competence } => {
            let competence = Competence::parse(&competence)?;
            Ok(format_summary(&reports::get_summary(conn, competence)?))
        }
        ReportCommands::Flagged { competence } => {
            let competence = parse_competence_opt(&competence)?;
            Ok(format_flagged(&reports::get_flagged(conn, competence)?))
        }
        ReportCommands::CpfProblems { competence } => {
            let competence = parse_competence_opt(&competence)?;
            Ok(format_cpf_problems(&reports::get_cpf_problems(conn, competence)?))
        }
        ReportCommands::Divergences { run } => {
            Ok(format_divergences(&reconciler::list_divergences(conn, run)?))
        }
        ReportCommands::Runs => Ok(format_runs(&reconciler::list_runs(conn)?)),
        ReportCommands::Audit { action, limit } => {
            let action = action.map(|a| a.to_uppercase());
            Ok(format_audit(&audit::list(conn, action.as_deref(), limit)?))
        }
        ReportCommands::Imports => Ok(format_imports(&reports::get_imports(conn)?)),
    }
}

// ---------------------------------------------------------------------------
// Pure formatting functions (report data → String)
// ---------------------------------------------------------------------------

pub fn format_summary(s: &Summary) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![Cell::new("Beneficiaries"), Cell::new(s.beneficiaries)]);
    table.add_row(vec![Cell::new("Payments"), Cell::new(s.payments)]);
    table.add_row(vec![Cell::new("Cards"), Cell::new(s.cards)]);
    table.add_row(vec![Cell::new("Projects"), Cell::new(s.projects)]);
    table.add_row(vec![Cell::new("Total".bold()), Cell::new(money(s.total))]);
    table.add_row(vec![Cell::new(""), Cell::new("")]);
    table.add_row(vec![Cell::new("Clean".green()), Cell::new(s.clean)]);
    table.add_row(vec![
        Cell::new("Flagged".yellow()),
        Cell::new(format!("{} ({})", s.flagged, money(s.flagged_amount))),
    ]);
    table.add_row(vec![Cell::new("Blocked from remittance".red()), Cell::new(s.blocked)]);
    table.add_row(vec![
        Cell::new("Duplicate payments"),
        Cell::new(format!("{} ({})", s.duplicate_payments, money(s.duplicate_amount))),
    ]);
    table.add_row(vec![Cell::new("Rejected rows"), Cell::new(s.rejected)]);
    table.add_row(vec![Cell::new("Dropped rows"), Cell::new(s.dropped)]);
    let mut out = format!("Malha Fina summary {}\n{table}", s.competence);

    if !s.by_flag.is_empty() {
        let mut ftable = Table::new();
        ftable.set_header(vec!["Flag", "Records", "Amount"]);
        for line in &s.by_flag {
            let code = if line.flag.is_blocking() {
                line.flag.code().red().to_string()
            } else {
                line.flag.code().yellow().to_string()
            };
            ftable.add_row(vec![Cell::new(code), Cell::new(line.records), Cell::new(money(line.amount))]);
        }
        out.push_str(&format!("\n\nBy flag\n{ftable}"));
    }
    out
}

pub fn format_flagged(rows: &[FlaggedRow]) -> String {
    if rows.is_empty() {
        return "No flagged records.".green().to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["ID", "Competence", "CPF", "Card", "Name", "Amount", "Flags"]);
    for row in rows {
        let p = &row.payment;
        let name = match &row.canonical_name {
            Some(canonical) if canonical != &p.name => format!("{} (= {canonical})", p.name),
            _ => p.name.clone(),
        };
        table.add_row(vec![
            Cell::new(p.id.map(|id| id.to_string()).unwrap_or_default()),
            Cell::new(p.competence),
            Cell::new(cpf(&p.cpf)),
            Cell::new(&p.card_number),
            Cell::new(name),
            Cell::new(money(p.amount)),
            Cell::new(p.flags.to_codes()),
        ]);
    }
    format!("Flagged records ({})\n{table}", rows.len())
}

pub fn format_cpf_problems(data: &CpfProblems) -> String {
    if data.rows.is_empty() {
        return "No rejected rows.".green().to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["File", "Line", "CPF as read", "Card", "Name", "Problem"]);
    for r in &data.rows {
        table.add_row(vec![
            Cell::new(&r.filename),
            Cell::new(r.line),
            Cell::new(&r.cpf_original),
            Cell::new(&r.card_number),
            Cell::new(&r.name),
            Cell::new(&r.problem),
        ]);
    }
    format!(
        "CPF problems: {} empty, {} invalid characters, {} wrong length, {} missing card\n{table}",
        data.empty, data.invalid_characters, data.wrong_length, data.missing_card
    )
}

pub fn format_divergences(rows: &[StoredDivergence]) -> String {
    if rows.is_empty() {
        return "No divergences.".green().to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["Run", "CPF", "Type", "System name", "Bank name", "Detail"]);
    for d in rows {
        let r = &d.record;
        table.add_row(vec![
            Cell::new(d.run_id),
            Cell::new(cpf(&r.cpf)),
            Cell::new(r.divergence_type.code()),
            Cell::new(r.system_name.as_deref().unwrap_or("")),
            Cell::new(r.bank_name.as_deref().unwrap_or("")),
            Cell::new(&r.detail),
        ]);
    }
    format!("Divergences ({})\n{table}", rows.len())
}

pub fn format_runs(rows: &[RunRow]) -> String {
    if rows.is_empty() {
        return "No reconciliation runs.".to_string();
    }
    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Competence", "Bank file", "Status", "Matched", "Parse errors", "Divergences", "By", "Started",
    ]);
    for r in rows {
        let status = match r.status.as_str() {
            "COMPLETED" => r.status.green().to_string(),
            "FAILED" => r.status.red().to_string(),
            _ => r.status.yellow().to_string(),
        };
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(&r.competence),
            Cell::new(&r.bank_file),
            Cell::new(status),
            Cell::new(r.matched),
            Cell::new(r.parse_errors),
            Cell::new(r.divergences),
            Cell::new(&r.run_by),
            Cell::new(&r.started_at),
        ]);
    }
    format!("Reconciliation runs\n{table}")
}

pub fn format_audit(rows: &[AuditRow]) -> String {
    if rows.is_empty() {
        return "Audit log is empty.".to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["When", "Actor", "Action", "Entity", "Details"]);
    for r in rows {
        let action = if r.action == "ACCESS_DENIED" {
            r.action.red().to_string()
        } else {
            r.action.clone()
        };
        table.add_row(vec![
            Cell::new(&r.timestamp),
            Cell::new(&r.actor),
            Cell::new(action),
            Cell::new(&r.affected_entity),
            Cell::new(&r.details),
        ]);
    }
    format!("Audit log\n{table}")
}

pub fn format_imports(rows: &[ImportRow]) -> String {
    if rows.is_empty() {
        return "No imports.".to_string();
    }
    let mut table = Table::new();
    table.set_header(vec!["ID", "File", "Date", "By", "Rows", "Stored", "Dropped", "Rejected"]);
    for r in rows {
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(&r.filename),
            Cell::new(&r.import_date),
            Cell::new(&r.imported_by),
            Cell::new(r.record_count),
            Cell::new(r.stored),
            Cell::new(r.dropped),
            Cell::new(r.rejected),
        ]);
    }
    format!("Imports\n{table}")
}
