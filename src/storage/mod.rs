//! Storage Layer
//!
//! Platform directories for configuration, model files and dictionaries.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "hybridocr", "HybridOcr")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

fn ensure(dir: PathBuf) -> Result<PathBuf> {
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
    Ok(dir)
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    ensure(project_dirs()?.data_dir().to_path_buf())
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    ensure(project_dirs()?.config_dir().to_path_buf())
}

/// Default configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

/// Where neural model files are kept
pub fn get_models_dir() -> Result<PathBuf> {
    ensure(get_data_dir()?.join("models"))
}

/// Where spell-check dictionaries are looked up
pub fn get_dictionaries_dir() -> Result<PathBuf> {
    ensure(get_data_dir()?.join("dictionaries"))
}
