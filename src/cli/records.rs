use crate::cli::{open_session, RecordsCommands};
use crate::corrections::{delete_record, edit_record, RecordEdit};
use crate::error::{MalhaError, Result};
use crate::fmt::{cpf, money};
use crate::importer::parse_amount;

pub fn dispatch(user: Option<&str>, cmd: RecordsCommands) -> Result<()> {
    let session = open_session(user)?;
    let policy = session.settings.duplicate_policy;
    match cmd {
        RecordsCommands::Edit {
            id,
            cpf: new_cpf,
            card,
            name,
            amount,
        } => {
            let amount = amount
                .map(|raw| parse_amount(&raw).ok_or(MalhaError::InvalidAmount(raw)))
                .transpose()?;
            let edit = RecordEdit {
                cpf: new_cpf,
                card_number: card,
                name,
                amount,
            };
            let p = edit_record(&session.conn, &session.actor, id, &edit, policy)?;
            println!(
                "Payment {id}: {} {} {} {}",
                cpf(&p.cpf),
                p.card_number,
                p.name,
                money(p.amount)
            );
            if p.flags.is_empty() {
                println!("No flags.");
            } else {
                println!("Flags: {}", p.flags.to_codes());
            }
        }
        RecordsCommands::Delete { id } => {
            delete_record(&session.conn, &session.actor, id, policy)?;
            println!("Payment {id} deleted.");
        }
    }
    Ok(())
}
