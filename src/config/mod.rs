pub mod settings;

pub use settings::{Config, CaptureConfig, ServerConfig, ConfigError};
