use std::io::{BufRead, Write};

use colored::Colorize;

use crate::cli::open_session;
use crate::corrections::reset_database;
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::permissions::{can_reset_database, Capability};

pub fn run(user: Option<&str>, yes: bool) -> Result<()> {
    let session = open_session(user)?;
    // refuse before prompting so a denied user is never asked
    if !can_reset_database(session.actor.role) {
        session
            .actor
            .require(&session.conn, Capability::ResetDatabase, "database")?;
    }

    if !yes {
        print!(
            "{} This deletes every payment, import and reconciliation run. Type 'reset' to continue: ",
            "Warning:".red().bold()
        );
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().lock().read_line(&mut input)?;
        if input.trim() != "reset" {
            println!("Aborted.");
            return Ok(());
        }
    }

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let backup_path = session
        .data_dir
        .join("backups")
        .join(format!("malha-before-reset-{stamp}.db"));
    let size = reset_database(&session.conn, &session.actor, &backup_path)?;
    println!("Backup saved to {} ({})", backup_path.display(), format_bytes(size));
    println!("Database reset. Users and the audit log were kept.");
    Ok(())
}
