pub mod common;

use anyhow::Result;
use std::path::PathBuf;

pub use common::{atomic_write, ensure_directory_exists, read_if_exists};

const APP_NAME: &str = "watch-budget";

/// Get the per-user config file path
pub fn get_config_path() -> Result<PathBuf> {
    match directories::ProjectDirs::from("", "", APP_NAME) {
        Some(dirs) => Ok(dirs.config_dir().join("config.yaml")),
        None => anyhow::bail!("Could not determine config file location"),
    }
}

/// Get the per-user directory holding the ledger and usage records
pub fn get_state_dir() -> Result<PathBuf> {
    match directories::ProjectDirs::from("", "", APP_NAME) {
        Some(dirs) => Ok(dirs.data_local_dir().to_path_buf()),
        None => anyhow::bail!("Could not determine state directory location"),
    }
}
