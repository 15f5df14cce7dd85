use colored::Colorize;

use crate::cli::report::format_summary;
use crate::cli::{open_session, parse_competence_opt};
use crate::error::Result;
use crate::importer::revalidate;
use crate::permissions::Capability;
use crate::reports;

pub fn run(user: Option<&str>, competence: Option<String>) -> Result<()> {
    let session = open_session(user)?;
    let competence = parse_competence_opt(&competence)?;
    session
        .actor
        .require(&session.conn, Capability::Import, "payments")?;

    let outcome = revalidate(&session.conn, &session.actor.name, session.settings.duplicate_policy)?;
    println!(
        "{} clean, {} flagged, {} changed",
        outcome.clean.to_string().green(),
        outcome.flagged.to_string().yellow(),
        outcome.changed.len()
    );
    if let Some(c) = competence {
        println!("{}", format_summary(&reports::get_summary(&session.conn, c)?));
    }
    Ok(())
}
