//! Loading [`SecurityConfig`] from disk.

use std::fs;
use std::path::Path;

use hush_crypto::SecurityConfig;
use tracing::debug;

use crate::error::Result;

/// Read a JSON config file. Missing fields fall back to their defaults; the
/// result is validated before it is returned.
pub fn load_config(path: impl AsRef<Path>) -> Result<SecurityConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)?;
    let config: SecurityConfig = serde_json::from_str(&raw)?;
    config.validate()?;

    debug!(path = %path.display(), "loaded security config");
    Ok(config)
}

/// [`load_config`] when a path is given, otherwise the defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<SecurityConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(SecurityConfig::default()),
    }
}
