//! `modelshare config` command implementation

use std::path::Path;

use anyhow::Context;
use modelshare_foundation::CacheConfig;
use tracing::debug;

use crate::output::{OutputFormat, render};

/// Load the cache configuration from `path`, or defaults when unset.
pub fn load_cache_config(path: Option<&Path>) -> anyhow::Result<CacheConfig> {
    let Some(path) = path else {
        debug!("no configuration file given, using defaults");
        return Ok(CacheConfig::default());
    };
    let path_str = path
        .to_str()
        .with_context(|| format!("configuration path is not valid UTF-8: {}", path.display()))?;
    let config = CacheConfig::from_file(path_str)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Execute the `modelshare config show` command
pub fn run_show(path: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_cache_config(path)?;
    println!("{}", render(&config, format)?);
    Ok(())
}
