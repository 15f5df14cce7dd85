use std::fmt;
use std::str::FromStr;

use rusqlite::Connection;

use crate::audit::{self, AuditAction, AuditLogEntry};
use crate::error::{MalhaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Analyst,
    Lead,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Import,
    Reconcile,
    ViewReports,
    Export,
    EditRecord,
    DeleteFile,
    ClearDivergences,
    ViewAuditLog,
    ResetDatabase,
    ManageUsers,
}

const ANALYST: &[Capability] = &[
    Capability::Import,
    Capability::Reconcile,
    Capability::ViewReports,
    Capability::Export,
];

const LEAD: &[Capability] = &[
    Capability::Import,
    Capability::Reconcile,
    Capability::ViewReports,
    Capability::Export,
    Capability::EditRecord,
    Capability::DeleteFile,
    Capability::ClearDivergences,
    Capability::ViewAuditLog,
];

const ADMIN: &[Capability] = &[
    Capability::Import,
    Capability::Reconcile,
    Capability::ViewReports,
    Capability::Export,
    Capability::EditRecord,
    Capability::DeleteFile,
    Capability::ClearDivergences,
    Capability::ViewAuditLog,
    Capability::ResetDatabase,
    Capability::ManageUsers,
];

impl Role {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Lead => "lead",
            Self::Admin => "admin",
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Self::Analyst => ANALYST,
            Self::Lead => LEAD,
            Self::Admin => ADMIN,
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Role {
    type Err = MalhaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "analyst" | "analista" => Ok(Self::Analyst),
            "lead" | "coordenador" => Ok(Self::Lead),
            "admin" | "administrador" => Ok(Self::Admin),
            other => Err(MalhaError::UnknownRole(other.to_string())),
        }
    }
}

impl Capability {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Import => "import files",
            Self::Reconcile => "run reconciliations",
            Self::ViewReports => "view reports",
            Self::Export => "export data",
            Self::EditRecord => "edit records",
            Self::DeleteFile => "delete imported files",
            Self::ClearDivergences => "clear divergences",
            Self::ViewAuditLog => "view the audit log",
            Self::ResetDatabase => "reset the database",
            Self::ManageUsers => "manage users",
        }
    }
}

pub fn can_edit_record(role: Role) -> bool {
    role.can(Capability::EditRecord)
}

pub fn can_delete_file(role: Role) -> bool {
    role.can(Capability::DeleteFile)
}

pub fn can_view_audit_log(role: Role) -> bool {
    role.can(Capability::ViewAuditLog)
}

pub fn can_reset_database(role: Role) -> bool {
    role.can(Capability::ResetDatabase)
}

pub fn can_clear_divergences(role: Role) -> bool {
    role.can(Capability::ClearDivergences)
}

pub fn can_manage_users(role: Role) -> bool {
    role.can(Capability::ManageUsers)
}

/// The user a command runs as.
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn resolve(conn: &Connection, name: &str) -> Result<Self> {
        let role: String = conn
            .query_row("SELECT role FROM users WHERE name = ?1", [name], |r| r.get(0))
            .map_err(|_| MalhaError::UnknownUser(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            role: role.parse()?,
        })
    }

    /// Refuse before any mutation happens; a refusal is itself audited.
    pub fn require(&self, conn: &Connection, capability: Capability, entity: &str) -> Result<()> {
        if self.role.can(capability) {
            return Ok(());
        }
        tracing::warn!(user = %self.name, role = %self.role, action = capability.describe(), "access denied");
        audit::record(
            conn,
            AuditLogEntry::now(
                &self.name,
                AuditAction::AccessDenied,
                entity,
                format!("role {} may not {}", self.role, capability.describe()),
            ),
        )?;
        Err(MalhaError::PermissionDenied {
            user: self.name.clone(),
            role: self.role.to_string(),
            action: capability.describe().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};

    #[test]
    fn test_predicates_per_role() {
        assert!(!can_edit_record(Role::Analyst));
        assert!(can_edit_record(Role::Lead));
        assert!(can_delete_file(Role::Lead));
        assert!(!can_view_audit_log(Role::Analyst));
        assert!(can_view_audit_log(Role::Admin));
        assert!(!can_reset_database(Role::Lead));
        assert!(can_reset_database(Role::Admin));
        assert!(!can_clear_divergences(Role::Analyst));
        assert!(can_clear_divergences(Role::Lead));
        assert!(!can_manage_users(Role::Lead));
        assert!(can_manage_users(Role::Admin));
    }

    #[test]
    fn test_roles_are_nested() {
        for cap in Role::Analyst.capabilities() {
            assert!(Role::Lead.can(*cap), "lead lacks {cap:?}");
        }
        for cap in Role::Lead.capabilities() {
            assert!(Role::Admin.can(*cap), "admin lacks {cap:?}");
        }
    }

    #[test]
    fn test_parse_role() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("analista".parse::<Role>().unwrap(), Role::Analyst);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_denied_action_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        conn.execute("INSERT INTO users (name, role) VALUES ('bia', 'analyst')", []).unwrap();
        let actor = Actor::resolve(&conn, "bia").unwrap();
        let err = actor.require(&conn, Capability::ResetDatabase, "database").unwrap_err();
        assert!(matches!(err, MalhaError::PermissionDenied { .. }));
        assert_eq!(audit::count(&conn, AuditAction::AccessDenied).unwrap(), 1);
        assert!(actor.require(&conn, Capability::Import, "file").is_ok());
    }

    #[test]
    fn test_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        assert!(matches!(Actor::resolve(&conn, "ghost"), Err(MalhaError::UnknownUser(_))));
    }
}
