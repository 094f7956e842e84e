//! Configuration management for the turn pipeline
//!
//! Supports loading configuration from:
//! - YAML/TOML files (`config/default.*`, `config/{env}.*`)
//! - Environment variables (VOICE_TURN_ prefix, `__` separator)

pub mod pipeline;
pub mod settings;

pub use pipeline::{
    AudioConfig, BargeInConfig, CircuitBreakerConfig, DialogueConfig, PipelineConfig,
    SynthesisConfig, TranscriptionConfig, TurnDetectionConfig,
};
pub use settings::{load_settings, load_settings_from, ObservabilityConfig, Settings};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}
