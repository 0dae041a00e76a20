use labsync_core::{Value, Variables};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "ws://localhost:3000";
const DEFAULT_ROOM: &str = "room-x";
const DEFAULT_INTERVAL_MS: u64 = 3000;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Endpoint configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Relay server URL (e.g., "ws://localhost:3000")
    pub server_url: ConfigValue<String>,
    /// Room shared by the experiment and its web clients
    pub room: ConfigValue<String>,
    /// Supervision window in milliseconds
    pub interval_ms: ConfigValue<u64>,
    /// Initial control variables
    pub variables: ConfigValue<Variables>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    server_url: Option<String>,
    room: Option<String>,
    interval_ms: Option<u64>,
    variables: Option<Variables>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut server_url =
            ConfigValue::new(DEFAULT_SERVER_URL.to_string(), ConfigSource::Default);
        let mut room = ConfigValue::new(DEFAULT_ROOM.to_string(), ConfigSource::Default);
        let mut interval_ms = ConfigValue::new(DEFAULT_INTERVAL_MS, ConfigSource::Default);
        let mut variables = ConfigValue::new(Self::default_variables(), ConfigSource::Default);
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(name) = file_config.room {
                room = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(ms) = file_config.interval_ms {
                interval_ms = ConfigValue::new(ms, ConfigSource::File);
            }
            if let Some(vars) = file_config.variables {
                variables = ConfigValue::new(vars, ConfigSource::File);
            }
        }

        // Apply environment variable overrides
        if let Ok(url) = std::env::var("LABSYNC_SERVER_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(name) = std::env::var("LABSYNC_ROOM") {
            room = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Ok(ms) = std::env::var("LABSYNC_INTERVAL_MS") {
            let ms = ms
                .parse()
                .map_err(|_| ConfigError::InvalidValue("LABSYNC_INTERVAL_MS", ms))?;
            interval_ms = ConfigValue::new(ms, ConfigSource::Environment);
        }

        if interval_ms.value == 0 {
            return Err(ConfigError::InvalidValue(
                "interval_ms",
                interval_ms.value.to_string(),
            ));
        }

        Ok(Self {
            server_url,
            room,
            interval_ms,
            variables,
            config_file,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.value)
    }

    /// Three toggle buttons, all off.
    pub fn default_variables() -> Variables {
        ["btn1", "btn2", "btn3"]
            .into_iter()
            .map(|name| (name.to_string(), Value::Bool(false)))
            .collect()
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/labsync/
    /// - macOS: ~/Library/Application Support/labsync/
    /// - Windows: %APPDATA%/labsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("labsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
