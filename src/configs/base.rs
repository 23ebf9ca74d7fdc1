use serde::{Deserialize, Serialize};

use crate::{common::errors::AnyResult, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub demo: DemoConfig,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        crate::log_println!("Loading configuration from: {}", config_path);

        let config_str = std::fs::read_to_string(config_path)?;
        Self::parse(&config_str).map_err(|e| format!("{config_path}: {e}").into())
    }

    pub fn parse(config_str: &str) -> AnyResult<Self> {
        if config_str.trim().is_empty() {
            return Err("configuration is empty".into());
        }
        let config: Config = toml::from_str(config_str)?;
        config.encoder.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::parse("[encoder]\ninput_mode = \"zero-copy\"\n").unwrap();
        assert_eq!(config.encoder.input_mode, InputMode::ZeroCopy);
        assert_eq!(config.encoder.timeouts.state_change_ms, 5000);
        assert!(config.logging.is_none());
        assert_eq!(config.demo.frames, DemoConfig::default().frames);
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(Config::parse("  \n").is_err());
    }

    #[test]
    fn bundled_default_config_parses() {
        let config = Config::parse(include_str!("../../config.default.toml")).unwrap();
        assert_eq!(config.encoder.params.target_bitrate, Some(2_000_000));
        assert!(config.logging.is_some());
    }
}
