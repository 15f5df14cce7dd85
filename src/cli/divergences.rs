use crate::cli::{open_session, DivergencesCommands};
use crate::corrections::clear_divergences;
use crate::error::Result;

pub fn dispatch(user: Option<&str>, cmd: DivergencesCommands) -> Result<()> {
    let session = open_session(user)?;
    match cmd {
        DivergencesCommands::Clear { run } => {
            let n = clear_divergences(&session.conn, &session.actor, run)?;
            match run {
                Some(id) => println!("{n} divergences cleared from run {id}."),
                None => println!("{n} divergences cleared."),
            }
        }
    }
    Ok(())
}
