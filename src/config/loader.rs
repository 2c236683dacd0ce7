use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{definition::Definition, models::GatewayConfig};

/// Prefix of environment variables overriding gateway settings, e.g.
/// `SWITCHYARD_LISTEN_ADDR` or `SWITCHYARD_TRANSPORT__CONNECT_TIMEOUT`.
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Pick a file format from the extension. Defaults to YAML.
pub fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))
}

/// Load gateway settings from an optional file, then apply environment
/// overrides.
pub fn load_gateway_config(config_path: Option<&str>) -> Result<GatewayConfig> {
    let mut builder = Config::builder();

    if let Some(config_path) = config_path {
        let path = Path::new(config_path);
        builder = builder.add_source(File::new(path_str(path)?, file_format(path)));
    }

    let settings = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build gateway configuration")?;

    settings
        .try_deserialize()
        .context("Failed to deserialize gateway configuration")
}

/// Load a route definition file (YAML, JSON or TOML).
///
/// The returned definition has version 0; sources stamp their own version.
pub fn load_definition(definition_path: impl AsRef<Path>) -> Result<Definition> {
    let path = definition_path.as_ref();

    let settings = Config::builder()
        .add_source(File::new(path_str(path)?, file_format(path)))
        .build()
        .with_context(|| format!("Failed to read definition from {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize definition from {}", path.display()))
}
