use comfy_table::{Cell, Table};

use crate::cli::{open_session, UsersCommands};
use crate::corrections::{add_user, list_users};
use crate::error::Result;
use crate::permissions::{
    can_clear_divergences, can_delete_file, can_edit_record, can_manage_users, can_reset_database,
    can_view_audit_log, Role,
};

fn mark(allowed: bool) -> &'static str {
    if allowed {
        "yes"
    } else {
        "-"
    }
}

pub fn dispatch(user: Option<&str>, cmd: UsersCommands) -> Result<()> {
    let session = open_session(user)?;
    match cmd {
        UsersCommands::Add { name, role } => {
            let role: Role = role.parse()?;
            add_user(&session.conn, &session.actor, &name, role)?;
            println!("User '{}' added as {role}.", name.trim());
        }
        UsersCommands::List => {
            let users = list_users(&session.conn)?;
            println!("{}", format_users(&users)?);
        }
    }
    Ok(())
}

pub fn format_users(users: &[(String, String, String)]) -> Result<String> {
    let mut table = Table::new();
    table.set_header(vec![
        "Name", "Role", "Edit", "Delete files", "Clear divergences", "Audit log", "Reset", "Users", "Created",
    ]);
    for (name, role, created) in users {
        let r: Role = role.parse()?;
        table.add_row(vec![
            Cell::new(name),
            Cell::new(role),
            Cell::new(mark(can_edit_record(r))),
            Cell::new(mark(can_delete_file(r))),
            Cell::new(mark(can_clear_divergences(r))),
            Cell::new(mark(can_view_audit_log(r))),
            Cell::new(mark(can_reset_database(r))),
            Cell::new(mark(can_manage_users(r))),
            Cell::new(created),
        ]);
    }
    Ok(table.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_users_shows_permissions() {
        let users = vec![
            ("admin".to_string(), "admin".to_string(), "2025-03-01".to_string()),
            ("bia".to_string(), "analyst".to_string(), "2025-03-02".to_string()),
        ];
        let out = format_users(&users).unwrap();
        let admin = out.lines().find(|l| l.contains("admin")).unwrap();
        let bia = out.lines().find(|l| l.contains("bia")).unwrap();
        assert_eq!(admin.matches("yes").count(), 6);
        assert_eq!(bia.matches("yes").count(), 0);
    }

    #[test]
    fn test_unknown_stored_role_is_an_error() {
        let users = vec![("x".to_string(), "root".to_string(), String::new())];
        assert!(format_users(&users).is_err());
    }
}
