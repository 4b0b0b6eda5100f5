//! Configuration Loader
//!
//! Layers configuration sources with the `config` crate:
//!
//! 0. `.env` file if present (via dotenvy)
//! 1. Struct defaults (every section is `#[serde(default)]`)
//! 2. Optional TOML file (`TASKER_ASYNC_CONFIG_PATH` or an explicit path)
//! 3. `TASKER_ASYNC__SECTION__FIELD` environment overrides
//!
//! The merged result is validated with `validator` before it is returned.

use super::error::{ConfigResult, ConfigurationError};
use super::AsyncConfig;
use ::config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use validator::Validate;

/// Environment variable naming the TOML file to load
pub const CONFIG_PATH_ENV: &str = "TASKER_ASYNC_CONFIG_PATH";

/// Prefix of override variables
pub const ENV_PREFIX: &str = "TASKER_ASYNC";

/// Stateless loader; all functions are associated
#[derive(Debug)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Detect environment from TASKER_ENV, defaulting to "development"
    pub fn detect_environment() -> String {
        std::env::var("TASKER_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    /// Load from `TASKER_ASYNC_CONFIG_PATH` (optional) plus environment overrides
    pub fn load_from_env() -> ConfigResult<AsyncConfig> {
        dotenvy::dotenv().ok();

        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load(path.as_deref())
    }

    /// Load an explicit file (if given) plus environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<AsyncConfig> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigurationError::file_read_error(
                    path.display().to_string(),
                    "not a readable file",
                ));
            }
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: AsyncConfig = builder.build()?.try_deserialize()?;
        Self::finish(config)
    }

    /// Load from a TOML string without environment overrides
    pub fn load_from_str(toml: &str) -> ConfigResult<AsyncConfig> {
        let config: AsyncConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Self::finish(config)
    }

    fn finish(config: AsyncConfig) -> ConfigResult<AsyncConfig> {
        config.validate()?;

        info!(
            environment = %Self::detect_environment(),
            broker_backend = %config.broker.backend,
            broker_url = %config.broker.redacted_url(),
            queue_name = %config.queue.name,
            retry_mode = ?config.retry.mode,
            cache_backend = %config.cache.backend,
            "Configuration loaded successfully"
        );

        Ok(config)
    }
}
