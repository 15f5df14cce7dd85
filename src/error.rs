use thiserror::Error;

#[derive(Error, Debug)]
pub enum MalhaError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Cannot read {file}: {cause}")]
    UnreadableFile { file: String, cause: String },

    #[error("Conflicting columns in {file}: {headers} all map to '{canonical}'")]
    ConflictingColumns {
        file: String,
        canonical: String,
        headers: String,
    },

    #[error("Missing required column '{column}' in {file}")]
    MissingColumn { file: String, column: String },

    #[error("No competence for {file}: pass --competence or include month/year columns")]
    MissingCompetence { file: String },

    #[error("No valid rows in {file}")]
    EmptyBatch { file: String },

    #[error("Reconciliation of {file} failed: {cause}")]
    ReconciliationFailed { file: String, cause: String },

    #[error("Invalid competence: {0} (expected YYYY-MM or MM/YYYY)")]
    InvalidCompetence(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Unknown role: {0} (expected analyst, lead or admin)")]
    UnknownRole(String),

    #[error("Permission denied: {user} ({role}) may not {action}")]
    PermissionDenied {
        user: String,
        role: String,
        action: String,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Layout error: {0}")]
    Layout(String),

    #[error("Illegal run transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MalhaError>;
