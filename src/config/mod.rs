//! Application configuration loading and validation.
//!
//! The configuration is read once at startup from a TOML file and stays
//! immutable afterwards. Every section defaults, so an empty file is a valid
//! configuration for a local broker.

use std::{
    fs,
    path::{Path, PathBuf},
};

use birdnet_mqtt_client::{
    availability::Availability,
    discovery::{AudioSource, DiscoveryConfig, DiscoverySettings},
    ClientConfig,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use self::logger::LoggerConfig;

pub mod logger;

const CONFIG_ENV: &str = "BIRDNET_MQTT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/birdnet-mqtt/config.toml";

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[doc(hidden)]
pub fn early_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub mqtt: ClientConfig,

    #[validate(nested)]
    pub discovery: DiscoverySection,
}

/// Home Assistant discovery plus the sources it announces.
#[derive(Serialize, Deserialize, Debug, Validate, Clone)]
#[serde(default)]
pub struct DiscoverySection {
    pub enabled: bool,

    #[serde(flatten)]
    #[validate(nested)]
    pub settings: DiscoveryConfig,

    pub sources: Vec<AudioSource>,

    /// Announce the sound level sensor for every source.
    pub sound_level: bool,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        DiscoverySection {
            enabled: true,
            settings: DiscoveryConfig::default(),
            sources: Vec::new(),
            sound_level: false,
        }
    }
}

impl DiscoverySection {
    pub fn feature_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            sound_level_enabled: self.sound_level,
        }
    }
}

impl Config {
    /// Locates, loads and validates the configuration file.
    ///
    /// # Errors
    /// `ConfigError` when no file is found or it cannot be read, parsed or
    /// validated.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load(&path)
    }

    /// `BIRDNET_MQTT_CONFIG` first, then `/etc/birdnet-mqtt/config.toml`.
    fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found; set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "configuration file does not exist: {}",
                path.display()
            )));
        }

        let config = Self::parse(&fs::read_to_string(path)?)?;
        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates TOML text. Availability is wired into the Last
    /// Will unless one is configured explicitly.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        if config.mqtt.last_will.is_none() {
            config.mqtt.last_will = Some(config.availability().last_will());
        }
        config.validate()?;
        Ok(config)
    }

    /// Status publisher bound to the discovery base topic, which is what the
    /// bridge entity watches.
    pub fn availability(&self) -> Availability {
        Availability::new(&self.discovery.settings.base_topic)
    }
}
