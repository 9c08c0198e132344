//! Agent configuration stored as TOML.
//!
//! A missing or broken config file never stops the agent: [`Config::load`]
//! falls back to defaults and logs why.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/collector-agent/config.toml";

const LOG_LEVELS: [&str; 5] = ["CRITICAL", "DEBUG", "ERROR", "INFO", "WARNING"];

/// Error type for configuration handling.
#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    Io(io::Error),
    /// The file is not valid TOML for [`Config`].
    Parse(toml::de::Error),
    /// The config could not be rendered as TOML.
    Serialize(toml::ser::Error),
    /// A field holds a value outside its allowed range.
    Invalid { key: String, message: String },
    /// `set_value` was given a key it does not know.
    UnknownKey(String),
    /// The file or its directory is not accessible to this user.
    PermissionDenied(PathBuf),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid TOML: {}", e),
            ConfigError::Serialize(e) => write!(f, "cannot serialize config: {}", e),
            ConfigError::Invalid { key, message } => write!(f, "invalid {}: {}", key, message),
            ConfigError::UnknownKey(key) => write!(f, "unknown configuration key: {}", key),
            ConfigError::PermissionDenied(path) => {
                write!(f, "permission denied: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

fn io_error(path: &Path, e: io::Error) -> ConfigError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        ConfigError::PermissionDenied(path.to_path_buf())
    } else {
        ConfigError::Io(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where snapshots are POSTed.
    pub endpoint: String,
    /// Seconds between collection cycles.
    pub interval: u64,
    pub exporters: ExportersConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/metrics".to_string(),
            interval: 30,
            exporters: ExportersConfig::default(),
            delivery: DeliveryConfig::default(),
            logging: LoggingConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportersConfig {
    pub node_exporter: NodeExporterConfig,
    pub nvidia_smi: NvidiaSmiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeExporterConfig {
    pub enabled: bool,
    pub url: String,
    /// Scrape timeout in seconds.
    pub timeout: u64,
}

impl Default for NodeExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:9100/metrics".to_string(),
            timeout: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvidiaSmiConfig {
    pub enabled: bool,
    /// Explicit binary location; looked up on `PATH` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvidia_smi_path: Option<PathBuf>,
}

impl Default for NvidiaSmiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nvidia_smi_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-request timeout in seconds.
    pub timeout: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: 10,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of DEBUG, INFO, WARNING, ERROR, CRITICAL.
    pub level: String,
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: PathBuf::from("/var/log/collector-agent.log"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("/var/run/collector-agent.pid"),
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!("Config file not found at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Error loading config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Loads and validates `path`, reporting what went wrong.
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        let mut config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as TOML, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| io_error(path, e))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks field ranges and normalizes the log level to upper case.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !is_valid_url(&self.endpoint) {
            return Err(invalid("endpoint", format!("invalid URL format: {}", self.endpoint)));
        }
        if !(1..=3600).contains(&self.interval) {
            return Err(invalid("interval", "must be between 1 and 3600 seconds"));
        }

        let node = &self.exporters.node_exporter;
        if !is_valid_url(&node.url) {
            return Err(invalid(
                "exporters.node_exporter.url",
                format!("invalid URL format: {}", node.url),
            ));
        }
        if !(1..=300).contains(&node.timeout) {
            return Err(invalid(
                "exporters.node_exporter.timeout",
                "must be between 1 and 300 seconds",
            ));
        }

        if !(1..=300).contains(&self.delivery.timeout) {
            return Err(invalid("delivery.timeout", "must be between 1 and 300 seconds"));
        }
        if self.delivery.max_retries == 0 {
            return Err(invalid("delivery.max_retries", "must be at least 1"));
        }

        let level = self.logging.level.to_uppercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "logging.level",
                format!(
                    "{} is not one of: {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            ));
        }
        self.logging.level = level;

        if !self.daemon.pid_file.is_absolute() {
            return Err(invalid(
                "daemon.pid_file",
                format!("must be an absolute path: {}", self.daemon.pid_file.display()),
            ));
        }
        Ok(())
    }

    /// Updates one dotted key. The change is kept only if the result validates.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut updated = self.clone();
        match key {
            "endpoint" => updated.endpoint = value.to_string(),
            "interval" => updated.interval = parse_number(key, value)?,
            "logging.level" => updated.logging.level = value.to_string(),
            "logging.file" => updated.logging.file = PathBuf::from(value),
            "daemon.pid_file" => updated.daemon.pid_file = PathBuf::from(value),
            "exporters.node_exporter.url" => updated.exporters.node_exporter.url = value.to_string(),
            "exporters.node_exporter.enabled" => {
                updated.exporters.node_exporter.enabled = parse_bool(value)
            }
            "exporters.node_exporter.timeout" => {
                updated.exporters.node_exporter.timeout = parse_number(key, value)?
            }
            "exporters.nvidia_smi.enabled" => updated.exporters.nvidia_smi.enabled = parse_bool(value),
            "exporters.nvidia_smi.nvidia_smi_path" => {
                updated.exporters.nvidia_smi.nvidia_smi_path =
                    (!value.is_empty()).then(|| PathBuf::from(value))
            }
            "delivery.timeout" => updated.delivery.timeout = parse_number(key, value)?,
            "delivery.max_retries" => updated.delivery.max_retries = parse_number(key, value)?,
            "delivery.retry_delay_ms" => updated.delivery.retry_delay_ms = parse_number(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Loads the config at `path`, sets `key` and saves it back.
pub fn set_config_value(key: &str, value: &str, path: &Path) -> Result<Config, ConfigError> {
    let mut config = Config::load(path);
    config.set_value(key, value)?;
    config.save(path)?;
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("expected a number, got {:?}", value)))
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Accepts `http(s)://` followed by a host-like start and no whitespace.
fn is_valid_url(url: &str) -> bool {
    let Some(rest) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        return false;
    };
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if !c.is_whitespace() && !"/$.?#".contains(c) => {}
        _ => return false,
    }
    match chars.next() {
        Some(c) if c != '\n' => {}
        _ => return false,
    }
    !rest.chars().any(char::is_whitespace)
}
