//! Subcommand implementations.

pub mod activate;
pub mod check_config;
pub mod parse;
pub mod run;
pub mod uids;

use std::path::Path;

use anyhow::{Context, Result};
use rollcall_core::RollcallConfig;

/// Loads and validates the configuration file.
pub fn load_config(path: &Path) -> Result<RollcallConfig> {
    RollcallConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}
