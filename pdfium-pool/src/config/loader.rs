//! Configuration loading from files and environment variables.

use std::path::Path;

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::de::DeserializeOwned;

use crate::error::{PoolError, PoolResult};

use super::{LibrarySettings, PoolConfig};

const ENV_PREFIX: &str = "PDFIUM_POOL";
const CONFIG_NAME: &str = "pdfium-pool";

fn sources(file: Option<&Path>) -> ConfigBuilder<DefaultState> {
    let builder = match file {
        Some(path) => Config::builder().add_source(File::from(path)),
        None => Config::builder().add_source(File::with_name(CONFIG_NAME).required(false)),
    };
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    )
}

fn build<T: DeserializeOwned>(file: Option<&Path>, what: &str) -> PoolResult<T> {
    sources(file)
        .build()
        .map_err(|e| PoolError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| PoolError::Config {
            message: format!("Failed to deserialize {}: {}", what, e),
        })
}

/// Load pool configuration from `pdfium-pool.*` (if present) and
/// `PDFIUM_POOL__*` environment variables, then validate it.
pub fn load_config() -> PoolResult<PoolConfig> {
    load_config_from(None)
}

/// Same as [`load_config`] with an explicit, required configuration file.
pub fn load_config_from(file: Option<&Path>) -> PoolResult<PoolConfig> {
    let config: PoolConfig = build(file, "pool config")?;
    config.validate()?;
    Ok(config)
}

/// Library settings only, as needed by the worker process.
pub fn load_library_settings() -> PoolResult<LibrarySettings> {
    #[derive(serde::Deserialize)]
    struct LibraryLoader {
        #[serde(default)]
        library: LibrarySettings,
    }

    let loader: LibraryLoader = build(None, "library settings")?;
    Ok(loader.library)
}
