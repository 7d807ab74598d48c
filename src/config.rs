//! Configuration loading and schema definitions for tlib.
//!
//! This module provides types and functions for loading tlib configuration
//! from TOML files or strings. The schema covers the run schedule, report
//! artifacts, notification, and command-backed test cases.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads tlib configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use tlib::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("tlib.toml"))?;
/// println!("Iterations: {}", config.run.iterations);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads tlib configuration from a TOML string.
///
/// # Example
///
/// ```
/// use tlib::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     iterations = 2
///     loop = 3
///
///     [[cases]]
///     id = "smoke"
///     command = "true"
/// "#)?;
///
/// assert_eq!(config.run.iterations, 2);
/// assert_eq!(config.run.loops, 3);
/// assert_eq!(config.cases.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
