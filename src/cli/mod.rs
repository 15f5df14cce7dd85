pub mod backup;
pub mod demo;
pub mod divergences;
pub mod export;
pub mod import;
pub mod imports;
pub mod init;
pub mod reconcile;
pub mod records;
pub mod report;
pub mod reset;
pub mod status;
pub mod users;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::db::{get_connection, is_initialized, DB_FILE};
use crate::error::{MalhaError, Result};
use crate::models::Competence;
use crate::permissions::Actor;
use crate::settings::{load_settings, Settings};

/// An opened database plus the user the command runs as.
pub(crate) struct Session {
    pub settings: Settings,
    pub data_dir: PathBuf,
    pub conn: Connection,
    pub actor: Actor,
}

pub(crate) fn open_session(user: Option<&str>) -> Result<Session> {
    let settings = load_settings();
    let data_dir = PathBuf::from(&settings.data_dir);
    let db_path = data_dir.join(DB_FILE);
    if !db_path.exists() {
        return Err(MalhaError::Other("No database found. Run `malha init` first.".to_string()));
    }
    let conn = get_connection(&db_path)?;
    if !is_initialized(&conn) {
        return Err(MalhaError::Other("Database is not initialized. Run `malha init` first.".to_string()));
    }
    let name = user.unwrap_or(&settings.default_user).to_string();
    let actor = Actor::resolve(&conn, &name)?;
    tracing::debug!(user = %actor.name, role = %actor.role, db = %db_path.display(), "session opened");
    Ok(Session {
        settings,
        data_dir,
        conn,
        actor,
    })
}

pub(crate) fn parse_competence_opt(raw: &Option<String>) -> Result<Option<Competence>> {
    raw.as_deref().map(Competence::parse).transpose()
}

/// `<data_dir>/exports/<stem>-<MMYYYY>.<ext>` unless an explicit path was given.
pub(crate) fn output_path(
    data_dir: &std::path::Path,
    output: Option<String>,
    stem: &str,
    competence: Option<Competence>,
    ext: &str,
) -> PathBuf {
    match output {
        Some(p) => PathBuf::from(p),
        None => {
            let suffix = match competence {
                Some(c) => c.packed(),
                None => chrono::Local::now().format("%Y%m%d").to_string(),
            };
            data_dir.join("exports").join(format!("{stem}-{suffix}.{ext}"))
        }
    }
}

#[derive(Parser)]
#[command(
    name = "malha",
    version,
    about = "Payroll validation (Malha Fina) and bank reconciliation for the POT program."
)]
pub struct Cli {
    /// Act as this user (default: settings' default_user)
    #[arg(long, global = true)]
    pub user: Option<String>,
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and bootstrap the database.
    Init {
        /// Path for malha data (default: ~/Documents/malha)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Import a payroll spreadsheet (CSV, XLSX or XLS).
    Import {
        /// Path to the spreadsheet
        file: String,
        /// Competence: YYYY-MM or MM/YYYY (default: month/year columns)
        #[arg(long)]
        competence: Option<String>,
    },
    /// Re-run the Malha Fina over stored records.
    Validate {
        /// Competence whose summary is printed afterwards
        #[arg(long)]
        competence: Option<String>,
    },
    /// Reconcile a bank return file against stored payments.
    Reconcile {
        /// Path to the fixed-width bank return file
        file: String,
        /// Competence: YYYY-MM or MM/YYYY
        #[arg(long)]
        competence: String,
    },
    /// Reports.
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// CSV exports and the bank remittance file.
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
    /// Correct or remove individual payment records.
    Records {
        #[command(subcommand)]
        command: RecordsCommands,
    },
    /// Manage imported files.
    Imports {
        #[command(subcommand)]
        command: ImportsCommands,
    },
    /// Manage stored divergences.
    Divergences {
        #[command(subcommand)]
        command: DivergencesCommands,
    },
    /// Manage users and roles.
    Users {
        #[command(subcommand)]
        command: UsersCommands,
    },
    /// Back up, then wipe payments, imports and reconciliation history.
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Back up the database.
    Backup {
        /// Output path (default: <data_dir>/backups/malha-YYYYMMDD-HHMMSS.db)
        #[arg(long)]
        output: Option<String>,
    },
    /// Show current database and summary statistics.
    Status,
    /// Generate a sample payroll and bank return, then import and reconcile them.
    Demo,
    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum ReportCommands {
    /// Totals and anomaly counts for one competence.
    Summary {
        #[arg(long)]
        competence: String,
    },
    /// Flagged records with their flags.
    Flagged {
        #[arg(long)]
        competence: Option<String>,
    },
    /// Rejected rows: cpf problems and missing cards.
    CpfProblems {
        #[arg(long)]
        competence: Option<String>,
    },
    /// Divergences from reconciliation runs.
    Divergences {
        /// Only this run
        #[arg(long)]
        run: Option<i64>,
    },
    /// Reconciliation runs.
    Runs,
    /// Audit log (lead and admin only).
    Audit {
        /// Filter by action code, e.g. RECORD_EDITED
        #[arg(long)]
        action: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Imported files.
    Imports,
}

#[derive(Subcommand)]
pub enum ExportCommands {
    /// All payments with their flags.
    Payments {
        #[arg(long)]
        competence: Option<String>,
        #[arg(long)]
        output: Option<String>,
    },
    /// Divergences from reconciliation runs.
    Divergences {
        #[arg(long)]
        run: Option<i64>,
        #[arg(long)]
        output: Option<String>,
    },
    /// Original against processed cpf, plus rejected rows.
    Adjustments {
        #[arg(long)]
        competence: Option<String>,
        #[arg(long)]
        output: Option<String>,
    },
    /// Fixed-width remittance file with every unblocked record.
    Remittance {
        #[arg(long)]
        competence: String,
        #[arg(long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum RecordsCommands {
    /// Edit a payment record and re-run the Malha Fina.
    Edit {
        /// Record ID (shown in `malha report flagged`)
        id: i64,
        #[arg(long)]
        cpf: Option<String>,
        #[arg(long)]
        card: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// New amount, e.g. 600,00
        #[arg(long)]
        amount: Option<String>,
    },
    /// Delete a payment record.
    Delete { id: i64 },
}

#[derive(Subcommand)]
pub enum ImportsCommands {
    /// Delete an imported file with all its records.
    Delete {
        /// Import ID (shown in `malha report imports`)
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum DivergencesCommands {
    /// Clear stored divergences.
    Clear {
        /// Only this run
        #[arg(long)]
        run: Option<i64>,
    },
}

#[derive(Subcommand)]
pub enum UsersCommands {
    /// Add a user.
    Add {
        name: String,
        /// analyst, lead or admin
        #[arg(long)]
        role: String,
    },
    /// List users.
    List,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_competence_opt() {
        assert_eq!(parse_competence_opt(&None).unwrap(), None);
        let c = parse_competence_opt(&Some("2025-03".to_string())).unwrap().unwrap();
        assert_eq!(c.to_string(), "03/2025");
        assert!(parse_competence_opt(&Some("2025-13".to_string())).is_err());
    }

    #[test]
    fn test_output_path_defaults_under_exports() {
        let dir = std::path::Path::new("/data");
        let c = Competence::new(3, 2025).unwrap();
        assert_eq!(
            output_path(dir, None, "pagamentos", Some(c), "csv"),
            PathBuf::from("/data/exports/pagamentos-032025.csv")
        );
        assert_eq!(
            output_path(dir, Some("x.csv".to_string()), "pagamentos", Some(c), "csv"),
            PathBuf::from("x.csv")
        );
    }

    #[test]
    fn test_global_user_flag() {
        let cli = Cli::try_parse_from(["malha", "status", "--user", "bia"]).unwrap();
        assert_eq!(cli.user.as_deref(), Some("bia"));
        assert!(matches!(cli.command, Commands::Status));
    }
}
