use std::path::PathBuf;

use crate::cli::open_session;
use crate::db::backup_to;
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::permissions::Capability;

pub fn run(user: Option<&str>, output: Option<String>) -> Result<()> {
    let session = open_session(user)?;
    // the copy carries the audit log
    session
        .actor
        .require(&session.conn, Capability::ViewAuditLog, "database")?;

    let dest_path = match output {
        Some(p) => PathBuf::from(p),
        None => {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            session.data_dir.join("backups").join(format!("malha-{stamp}.db"))
        }
    };

    let size = backup_to(&session.conn, &dest_path)?;
    println!("Backup saved to {}", dest_path.display());
    println!("Size: {}", format_bytes(size));
    Ok(())
}
