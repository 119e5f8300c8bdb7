//! CLI command implementations.

pub mod config;
pub mod decode;
pub mod simulate;

use anyhow::{Context, Result};
use cardsync_peer::NodeConfig;
use std::path::Path;

/// Load the node configuration, or the defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}
