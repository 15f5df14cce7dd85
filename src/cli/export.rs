use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use colored::Colorize;

use crate::cli::{open_session, output_path, parse_competence_opt, ExportCommands};
use crate::db;
use crate::error::Result;
use crate::export;
use crate::fmt::money;
use crate::models::Competence;
use crate::permissions::Capability;
use crate::reconciler;
use crate::remittance;
use crate::reports;

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

pub fn dispatch(user: Option<&str>, cmd: ExportCommands) -> Result<()> {
    let session = open_session(user)?;
    let conn = &session.conn;
    session.actor.require(conn, Capability::Export, "exports")?;
    let data_dir = session.data_dir.as_path();

    match cmd {
        ExportCommands::Payments { competence, output } => {
            let competence = parse_competence_opt(&competence)?;
            let records = match competence {
                Some(c) => db::load_payments_for(conn, c)?,
                None => db::load_payments(conn)?,
            };
            let path = output_path(data_dir, output, "pagamentos", competence, "csv");
            let n = export::write_payments(create(&path)?, &records)?;
            println!("{n} payments exported to {}", path.display());
        }
        ExportCommands::Divergences { run, output } => {
            let rows = reconciler::list_divergences(conn, run)?;
            let stem = match run {
                Some(id) => format!("divergencias-run{id}"),
                None => "divergencias".to_string(),
            };
            let path = output_path(data_dir, output, &stem, None, "csv");
            let n = export::write_divergences(create(&path)?, &rows)?;
            println!("{n} divergences exported to {}", path.display());
        }
        ExportCommands::Adjustments { competence, output } => {
            let competence = parse_competence_opt(&competence)?;
            let records = match competence {
                Some(c) => db::load_payments_for(conn, c)?,
                None => db::load_payments(conn)?,
            };
            let problems = reports::get_cpf_problems(conn, competence)?;
            let path = output_path(data_dir, output, "ajustes", competence, "csv");
            let n = export::write_adjustments(create(&path)?, &records, &problems.rows)?;
            println!("{n} rows exported to {}", path.display());
        }
        ExportCommands::Remittance { competence, output } => {
            let competence = Competence::parse(&competence)?;
            let path = output_path(data_dir, output, "remessa", Some(competence), "txt");
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let r = remittance::write(conn, competence, &path)?;
            println!(
                "{} records ({}) written to {}",
                r.included,
                money(r.total),
                path.display()
            );
            if !r.excluded.is_empty() {
                println!("{}", format!("{} records held back:", r.excluded.len()).yellow());
                for (id, reason) in &r.excluded {
                    let id = id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
                    println!("  {id:>6}  {reason}");
                }
            }
        }
    }
    Ok(())
}
