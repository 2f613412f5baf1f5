use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file '{0}': {1}")]
    Read(String, std::io::Error),

    #[error("Cannot write configuration file '{0}': {1}")]
    Write(String, std::io::Error),

    #[error("Invalid configuration file '{0}': {1}")]
    Parse(String, toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub snaplen: i32,
    pub timeout_ms: i32,
    pub promiscuous: bool,
    pub buffer_size: i32,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub subscriber_buffer: usize,
    pub shutdown_grace_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            snaplen: 65535,
            timeout_ms: 250,
            promiscuous: false,
            buffer_size: 2 * 1024 * 1024,
            stats_interval_secs: 30,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            subscriber_buffer: 1024,
            shutdown_grace_ms: 2000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_string(), e))?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| ConfigError::Write(path.to_string(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid("server.subscriber_buffer must be at least 1".to_string()));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("server.handshake_timeout_ms must be positive".to_string()));
        }
        if self.capture.timeout_ms <= 0 {
            return Err(ConfigError::Invalid("capture.timeout_ms must be positive".to_string()));
        }
        self.socket_addr()?;
        Ok(())
    }

    /// Listener address assembled from `bind_address` and `port`.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.server.bind_address.parse::<std::net::IpAddr>().map_err(|_| {
            ConfigError::Invalid(format!("server.bind_address '{}' is not an IP address", self.server.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}
