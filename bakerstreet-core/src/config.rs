use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable holding an explicit config file path
pub const CONFIG_PATH_ENV: &str = "BAKERSTREET_CONFIG_PATH";
/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "bakerstreet.yaml";

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 5000,
        }
    }
}

/// Registry tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds between liveness sweeps
    pub sweep_interval_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    /// TTL applied when a registration does not carry one
    pub default_ttl_secs: u64,
    /// Conflict retries absorbed by register, heartbeat and deregister
    pub heartbeat_retries: u32,
    /// Queued events per watcher before it is marked lagged
    pub subscriber_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 1,
            min_ttl_secs: 1,
            max_ttl_secs: 3600,
            default_ttl_secs: 30,
            heartbeat_retries: 3,
            subscriber_buffer: 256,
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sweep_interval_secs == 0 {
            errors.push("registry.sweep_interval_secs must be greater than 0".to_string());
        }
        if self.min_ttl_secs == 0 {
            errors.push("registry.min_ttl_secs must be greater than 0".to_string());
        }
        if self.min_ttl_secs > self.max_ttl_secs {
            errors.push(format!(
                "registry.min_ttl_secs ({}) exceeds registry.max_ttl_secs ({})",
                self.min_ttl_secs, self.max_ttl_secs
            ));
        }
        if self.default_ttl_secs < self.min_ttl_secs || self.default_ttl_secs > self.max_ttl_secs {
            errors.push(format!(
                "registry.default_ttl_secs ({}) must be between {} and {}",
                self.default_ttl_secs, self.min_ttl_secs, self.max_ttl_secs
            ));
        }
        if self.subscriber_buffer == 0 {
            errors.push("registry.subscriber_buffer must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // BAKERSTREET_REGISTRY__DEFAULT_TTL_SECS, BAKERSTREET_SERVER__HTTP_PORT, ...
        builder = builder.add_source(
            Environment::with_prefix("BAKERSTREET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Collect every misconfiguration instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.registry.validate().err().unwrap_or_default();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level \"{}\" is not a valid level", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. `explicit` (command line)
/// 2. `BAKERSTREET_CONFIG_PATH` environment variable
/// 3. `./bakerstreet.yaml`
/// 4. Fall back to environment variables only
///
/// Runs before logging is initialized, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            anyhow::bail!("Config file {path} does not exist");
        }
    }

    let config_path = explicit
        .map(str::to_string)
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| Path::new(DEFAULT_CONFIG_FILE).exists().then(|| DEFAULT_CONFIG_FILE.to_string()));

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config from environment: {e}"))?
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}
