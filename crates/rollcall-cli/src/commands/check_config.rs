//! `rollcall check-config`

use std::path::Path;

use anyhow::{Context, Result};

use super::load_config;

/// Validates the configuration and secrets, then prints the configuration.
pub fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    config
        .resolve_credentials()
        .context("configuration is valid but a secret is missing")?;

    println!("Configuration OK: {}", config_path.display());
    println!();
    print!("{}", config.to_toml().context("failed to render configuration")?);
    Ok(())
}
