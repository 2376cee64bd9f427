//! Layered configuration loading
//!
//! Layers, lowest precedence first: the type's `Default`, an optional TOML
//! file, then environment variables. With the default prefix a variable like
//! `CALLRELAY_RELAY__MAX_BUFFERED_FRAMES=80` overrides `relay.max_buffered_frames`.
//! List-valued keys can only be set from the file.

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{Error, Result};

/// Default environment prefix
pub const ENV_PREFIX: &str = "CALLRELAY";

/// Separator between nested keys in environment variable names
pub const ENV_SEPARATOR: &str = "__";

/// Where configuration values come from
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    file: Option<PathBuf>,
    env_prefix: Option<String>,
    env_override: Option<HashMap<String, String>>,
}

impl ConfigSource {
    /// Defaults only
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Layer a required TOML file over the defaults
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Layer environment variables with the standard prefix
    pub fn with_env(self) -> Self {
        self.with_env_prefix(ENV_PREFIX)
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Read variables from `vars` instead of the process environment
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        if self.env_prefix.is_none() {
            self.env_prefix = Some(ENV_PREFIX.to_string());
        }
        self.env_override = Some(vars);
        self
    }
}

/// Load a configuration value of type `T` from the given layers
pub fn load_config<T>(source: &ConfigSource) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    let defaults = Config::try_from(&T::default())?;
    let mut builder = Config::builder().add_source(defaults);

    if let Some(path) = &source.file {
        if !path.exists() {
            return Err(Error::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path.clone()).format(FileFormat::Toml));
    }

    if let Some(prefix) = &source.env_prefix {
        let env = Environment::with_prefix(prefix)
            .prefix_separator("_")
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(source.env_override.clone());
        builder = builder.add_source(env);
    }

    let value = builder.build()?.try_deserialize::<T>()?;
    tracing::debug!(file = ?source.file, env = ?source.env_prefix, "configuration loaded");
    Ok(value)
}
