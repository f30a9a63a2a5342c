//! Configuration module for Sockpump
//!
//! The configuration file is a flat list of `Key=Value` lines. Blank lines
//! and lines starting with `#` are ignored; values that look like integers
//! are read as integers, everything else as strings.

mod interface;
mod server;

pub use interface::{resolve_interface, InterfaceResolver, SystemInterfaces};
pub use server::{Config, ServerSettings, ANY_INTERFACE, MIN_BUFFER_SIZE};

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Load configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from `Key=Value` lines
pub fn parse_config(content: &str) -> Result<Config> {
    let mut table = toml::Table::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            bail!("Line {}: expected Key=Value, got `{}`", index + 1, line);
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            bail!("Line {}: missing key", index + 1);
        }

        let value = match value.parse::<i64>() {
            Ok(number) => toml::Value::Integer(number),
            Err(_) => toml::Value::String(value.to_string()),
        };
        if table.insert(key.to_string(), value).is_some() {
            bail!("Line {}: duplicate key `{}`", index + 1, key);
        }
    }

    let config: Config = toml::Value::Table(table)
        .try_into()
        .with_context(|| "Failed to parse configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;

    Ok(config)
}
