use crate::cli::{open_session, ImportsCommands};
use crate::corrections::delete_import;
use crate::error::Result;

pub fn dispatch(user: Option<&str>, cmd: ImportsCommands) -> Result<()> {
    let session = open_session(user)?;
    match cmd {
        ImportsCommands::Delete { id } => {
            let removed = delete_import(&session.conn, &session.actor, id, session.settings.duplicate_policy)?;
            println!("Import {id} deleted ({removed} payments removed).");
        }
    }
    Ok(())
}
