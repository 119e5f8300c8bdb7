//! Print the effective configuration.

use anyhow::Result;
use std::path::Path;

/// Run the config command.
pub fn run(path: Option<&Path>) -> Result<()> {
    let config = super::load_config(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}
