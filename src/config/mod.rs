//! Application configuration.
//!
//! Aggregates topic and role settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod roles;
mod topic;

pub use roles::{ProducerConfig, SchedulerConfig, ServerConfig, SweepStrategy};
pub use topic::{TopicConfig, DEFAULT_TOPIC};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "deadlane.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DEADLANE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DEADLANE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DEADLANE_LOG";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Topic and subscription settings.
    pub topic: TopicConfig,
    /// Dead-letter retriever scheduling.
    pub scheduler: SchedulerConfig,
    /// Client traffic generation.
    pub producer: ProducerConfig,
    /// Server live-queue consumption.
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `deadlane.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.topic.normalize();
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.topic.normalize();
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
