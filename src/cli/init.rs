use std::path::PathBuf;

use crate::db::{bootstrap, get_connection, DB_FILE, DEFAULT_ADMIN};
use crate::error::Result;
use crate::settings::{load_settings, save_settings, shellexpand_path};

pub fn run(data_dir: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
    }
    save_settings(&settings)?;

    let resolved = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&resolved)?;
    std::fs::create_dir_all(resolved.join("exports"))?;
    std::fs::create_dir_all(resolved.join("backups"))?;

    let conn = get_connection(&resolved.join(DB_FILE))?;
    if bootstrap(&conn)? {
        println!("Initialized malha at {}", resolved.display());
        println!("Default user '{DEFAULT_ADMIN}' created with role admin.");
    } else {
        println!("malha already initialized at {}", resolved.display());
    }
    Ok(())
}
