//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use super::config::AppConfig;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::PathBuf;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Load configuration from files and environment
///
/// `extra` are files given on the command line, applied in order after the
/// `config/` directory and before the environment.
pub fn load_config(extra: &[PathBuf]) -> Result<AppConfig> {
    let mut builder = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!(
                "config/{}",
                std::env::var("RUNBUS_ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        .add_source(File::with_name("config/local").required(false));

    // 3. Files named on the command line
    for path in extra {
        if !path.is_file() {
            bail!("Cannot find file: {}", path.display());
        }
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    let config = builder
        // 4. Environment variables (highest priority)
        // prefix_separator("_") makes RUNBUS_BROKER__URL work (single _ after prefix).
        .add_source(
            Environment::with_prefix("RUNBUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}
