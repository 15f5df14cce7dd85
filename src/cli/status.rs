use crate::audit::{self, AuditAction};
use crate::db::{get_connection, get_metadata, DB_FILE};
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::reports::get_status;
use crate::settings::load_settings;

pub fn run() -> Result<()> {
    let settings = load_settings();
    let data_dir = std::path::PathBuf::from(&settings.data_dir);
    let db_path = data_dir.join(DB_FILE);

    println!("User:       {}", settings.default_user);
    println!("Data dir:   {}", data_dir.display());
    println!("Database:   {}", db_path.display());
    println!("Duplicates: {:?}", settings.duplicate_policy);

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `malha init` to set up.");
        return Ok(());
    }

    let size = std::fs::metadata(&db_path)?.len();
    println!("DB size:    {}", format_bytes(size));

    let conn = get_connection(&db_path)?;
    let since = get_metadata(&conn, "initialized_at");
    println!("Since:      {}", since.as_deref().unwrap_or("(not initialized)"));

    let info = get_status(&conn)?;
    let competences = info
        .competences
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    println!();
    println!("Users:         {}", info.users);
    println!("Imports:       {}", info.imports);
    println!("Payments:      {}", info.payments);
    println!("Flagged:       {}", info.flagged);
    println!("Runs:          {}", info.runs);
    println!("Divergences:   {}", info.divergences);
    println!("Access denied: {}", audit::count(&conn, AuditAction::AccessDenied)?);
    println!("Competences:   {}", if competences.is_empty() { "-" } else { &competences });
    println!("Last import:   {}", info.last_import.as_deref().unwrap_or("-"));
    Ok(())
}
