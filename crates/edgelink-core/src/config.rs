/*!
 * Driver process configuration for edgelink.
 *
 * This module loads and validates the options a driver process starts with:
 * module identity, bus endpoint, and logging.
 */
use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Options for a driver process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Module identity
    #[serde(default)]
    pub module: ModuleOptions,

    /// Bus connection options
    #[serde(default)]
    pub bus: BusOptions,

    /// Logging options
    #[serde(default)]
    pub logging: LoggingOptions,
}

/// Module identity options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOptions {
    /// The module (driver) name used for bus registration
    #[serde(default = "default_module_name")]
    pub name: String,

    /// Whether the things handled by this module are local to the gateway
    #[serde(default = "default_is_local")]
    pub is_local: bool,
}

/// Bus connection options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusOptions {
    /// The bus endpoint address
    #[serde(default = "default_bus_endpoint")]
    pub endpoint: String,

    /// Per-call timeout in milliseconds (0 means no timeout)
    #[serde(default)]
    pub call_timeout_ms: u64,
}

/// Logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Log filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            module: ModuleOptions::default(),
            bus: BusOptions::default(),
            logging: LoggingOptions::default(),
        }
    }
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            name: default_module_name(),
            is_local: default_is_local(),
        }
    }
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            endpoint: default_bus_endpoint(),
            call_timeout_ms: 0,
        }
    }
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_module_name() -> String {
    "edgelink-driver".to_string()
}

fn default_is_local() -> bool {
    true
}

fn default_bus_endpoint() -> String {
    "unix:///var/run/edgelink/bus.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A builder for driver options
#[derive(Debug, Default)]
pub struct DriverOptionsBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<DriverOptions>,
}

impl DriverOptionsBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with existing options
    pub fn override_with(mut self, options: DriverOptions) -> Self {
        self.override_with = Some(options);
        self
    }

    /// Build the options
    pub fn build(self) -> Result<DriverOptions> {
        let mut builder = ConfigLib::builder();

        let defaults = DriverOptions::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults)
                .map_err(|e| Error::config(format!("Failed to create default options: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading driver options from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Options file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading driver options from environment with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let loaded = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build options: {}", e)))?;

        let mut options: DriverOptions = loaded
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize options: {}", e)))?;

        if let Some(override_options) = self.override_with {
            options = override_options;
        }

        if options.module.name.is_empty() {
            return Err(Error::config("Module name must not be empty"));
        }

        info!("Driver options loaded for module {}", options.module.name);
        Ok(options)
    }
}

/// A thread-safe reference to driver options
#[derive(Debug, Clone)]
pub struct SharedOptions(Arc<DriverOptions>);

impl SharedOptions {
    /// Create new shared options
    pub fn new(options: DriverOptions) -> Self {
        Self(Arc::new(options))
    }

    /// Get a reference to the options
    pub fn get(&self) -> &DriverOptions {
        &self.0
    }
}

impl From<DriverOptions> for SharedOptions {
    fn from(options: DriverOptions) -> Self {
        Self::new(options)
    }
}

impl AsRef<DriverOptions> for SharedOptions {
    fn as_ref(&self) -> &DriverOptions {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_options() {
        let options = DriverOptions::default();
        assert_eq!(options.module.name, "edgelink-driver");
        assert!(options.module.is_local);
        assert_eq!(options.logging.level, "info");
        assert_eq!(options.bus.call_timeout_ms, 0);
    }

    #[test]
    fn test_builder_defaults() {
        let options = DriverOptionsBuilder::new().build().unwrap();
        assert_eq!(options.module.name, "edgelink-driver");
        assert_eq!(options.bus.endpoint, "unix:///var/run/edgelink/bus.sock");
    }

    #[test]
    fn test_builder_with_file() -> Result<()> {
        let dir = tempdir().map_err(|e| Error::other(e.to_string()))?;
        let file_path = dir.path().join("driver.toml");

        {
            let mut file = File::create(&file_path).map_err(|e| Error::other(e.to_string()))?;
            file.write_all(
                br#"
                [module]
                name = "light-driver"
                is_local = false

                [logging]
                level = "debug"
            "#,
            )
            .map_err(|e| Error::other(e.to_string()))?;
        }

        let options = DriverOptionsBuilder::new()
            .with_config_file(file_path)
            .build()?;

        assert_eq!(options.module.name, "light-driver");
        assert!(!options.module.is_local);
        assert_eq!(options.logging.level, "debug");

        Ok(())
    }

    #[test]
    fn test_builder_with_env() -> Result<()> {
        env::set_var("EDGELINK__MODULE__NAME", "env-driver");
        env::set_var("EDGELINK__LOGGING__LEVEL", "trace");

        let options = DriverOptionsBuilder::new()
            .with_environment_prefix("edgelink")
            .build()?;

        assert_eq!(options.module.name, "env-driver");
        assert_eq!(options.logging.level, "trace");

        env::remove_var("EDGELINK__MODULE__NAME");
        env::remove_var("EDGELINK__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_empty_module_name_rejected() {
        let mut options = DriverOptions::default();
        options.module.name = String::new();

        let result = DriverOptionsBuilder::new().override_with(options).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_shared_options() {
        let shared = SharedOptions::new(DriverOptions::default());
        assert_eq!(shared.get().module.name, "edgelink-driver");

        let shared2 = shared.clone();
        assert_eq!(shared2.get().module.name, "edgelink-driver");
    }
}
