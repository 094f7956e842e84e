//! Main settings module

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, PipelineConfig};

/// Top-level settings consumed by a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;

        if self.observability.log_level.trim().is_empty() {
            return Err(ConfigError::invalid(
                "observability.log_level",
                "must not be empty",
            ));
        }

        Ok(())
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Load settings from `config/` and the environment
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from(Path::new("config"), env)
}

/// Load settings from files in `dir` and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (VOICE_TURN_ prefix)
/// 2. {dir}/{env}.yaml|toml (if env specified)
/// 3. {dir}/default.yaml|toml
pub fn load_settings_from(dir: &Path, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::from(dir.join("default")).required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::from(dir.join(env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICE_TURN")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("pipeline.synthesis.providers")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    tracing::debug!(
        dir = %dir.display(),
        env = env.unwrap_or("default"),
        providers = ?settings.pipeline.synthesis.providers,
        "Loaded settings"
    );

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.observability.log_level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(dir.path(), None).unwrap();
        assert_eq!(settings.pipeline.turn_detection.end_of_turn_ms, 700);
        assert_eq!(settings.pipeline.synthesis.providers, vec!["primary", "fallback"]);
    }

    #[test]
    fn test_env_file_overrides_default_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.yaml"),
            "pipeline:\n  turn_detection:\n    end_of_turn_ms: 900\n  synthesis:\n    providers: [cartesia, google, elevenlabs]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("staging.yaml"),
            "pipeline:\n  turn_detection:\n    settle_window_ms: 150\nobservability:\n  log_json: true\n",
        )
        .unwrap();

        let settings = load_settings_from(dir.path(), Some("staging")).unwrap();
        let td = &settings.pipeline.turn_detection;
        assert_eq!(td.end_of_turn_ms, 900);
        assert_eq!(td.settle_window_ms, 150);
        assert_eq!(td.hangover_ms, 300);
        assert_eq!(
            settings.pipeline.synthesis.providers,
            vec!["cartesia", "google", "elevenlabs"]
        );
        assert!(settings.observability.log_json);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.yaml"),
            "pipeline:\n  synthesis:\n    circuit:\n      failure_threshold: 0\n",
        )
        .unwrap();

        let err = load_settings_from(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
