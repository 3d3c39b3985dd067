//! Configuration loading for the `vesper` binary

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use vesper_client::ClientConfig;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Load configuration.
///
/// Layers, later ones winning: the embedded defaults, `config/default.toml`,
/// `config/local.toml`, then `VESPER_*` environment variables
/// (`VESPER_SERVER__BASE_URL`, `VESPER_PUSH__URL`, ...).
pub fn load_config() -> Result<ClientConfig> {
    let config = Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name("config/local").required(false))
        .add_source(
            Environment::with_prefix("VESPER")
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
