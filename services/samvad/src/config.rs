use samvad_core::session::VoiceProfile;
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    /// Absent keys are reported per session as "Missing API Key", not at startup.
    pub gemini_api_key: Option<SecretString>,
    pub live_model: String,
    pub live_endpoint: String,
    pub content_path: PathBuf,
    pub voice: VoiceProfile,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);

        let live_model = std::env::var("GEMINI_LIVE_MODEL")
            .unwrap_or_else(|_| gemini_live::DEFAULT_MODEL.to_string());
        if live_model.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "GEMINI_LIVE_MODEL".to_string(),
                "model name must not be empty".to_string(),
            ));
        }

        let live_endpoint = std::env::var("GEMINI_LIVE_ENDPOINT")
            .unwrap_or_else(|_| gemini_live::DEFAULT_ENDPOINT.to_string());
        if !live_endpoint.starts_with("ws://") && !live_endpoint.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "GEMINI_LIVE_ENDPOINT".to_string(),
                format!("'{}' is not a websocket URL", live_endpoint),
            ));
        }

        let content_path = std::env::var("SAMVAD_CONTENT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/kings.json"));

        let voice = match std::env::var("SAMVAD_VOICE") {
            Ok(raw) => raw.parse::<VoiceProfile>().map_err(|e| {
                ConfigError::InvalidValue("SAMVAD_VOICE".to_string(), e.to_string())
            })?,
            Err(_) => VoiceProfile::default(),
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key,
            live_model,
            live_endpoint,
            content_path,
            voice,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("GEMINI_API_KEY");
            env::remove_var("GEMINI_LIVE_MODEL");
            env::remove_var("GEMINI_LIVE_ENDPOINT");
            env::remove_var("SAMVAD_CONTENT_PATH");
            env::remove_var("SAMVAD_VOICE");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env_vars();

        let config = Config::from_env().expect("Config should load successfully");

        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.live_model, gemini_live::DEFAULT_MODEL);
        assert_eq!(config.live_endpoint, gemini_live::DEFAULT_ENDPOINT);
        assert_eq!(config.content_path, PathBuf::from("./data/kings.json"));
        assert_eq!(config.voice, VoiceProfile::Male);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
            env::set_var("GEMINI_LIVE_MODEL", "models/custom-live");
            env::set_var("GEMINI_LIVE_ENDPOINT", "ws://127.0.0.1:9000/live");
            env::set_var("SAMVAD_CONTENT_PATH", "/custom/figures.json");
            env::set_var("SAMVAD_VOICE", "female");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(
            config.gemini_api_key.as_ref().map(|k| k.expose_secret()),
            Some("test-gemini-key")
        );
        assert_eq!(config.live_model, "models/custom-live");
        assert_eq!(config.live_endpoint, "ws://127.0.0.1:9000/live");
        assert_eq!(config.content_path, PathBuf::from("/custom/figures.json"));
        assert_eq!(config.voice, VoiceProfile::Female);
        assert_eq!(config.log_level, Level::DEBUG);
        // The key never shows up in debug output.
        assert!(!format!("{:?}", config).contains("test-gemini-key"));
    }

    #[test]
    #[serial]
    fn test_config_blank_key_is_missing() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "   ");
        }

        let config = Config::from_env().unwrap();
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    #[serial]
    fn test_config_invalid_voice() {
        clear_env_vars();
        unsafe {
            env::set_var("SAMVAD_VOICE", "robot");
        }

        let ConfigError::InvalidValue(var, _) = Config::from_env().unwrap_err();
        assert_eq!(var, "SAMVAD_VOICE");
    }

    #[test]
    #[serial]
    fn test_config_invalid_endpoint() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_LIVE_ENDPOINT", "https://example.com");
        }

        let ConfigError::InvalidValue(var, _) = Config::from_env().unwrap_err();
        assert_eq!(var, "GEMINI_LIVE_ENDPOINT");
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let ConfigError::InvalidValue(var, _) = Config::from_env().unwrap_err();
        assert_eq!(var, "RUST_LOG");
    }
}
