//! # sl-config
//!
//! Process settings for the Staffline binary: where the database lives, where
//! the gateway bridge is and which address the HTTP surface binds.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. `staffline.toml` in the working directory (optional)
//! 3. `STAFFLINE__*` environment variables, after `.env` is loaded
//!
//! Runtime bot behaviour (emojis, thresholds, responses) is not here; it lives
//! in the store and is read through `sl_core::ConfigCache`.

use std::net::SocketAddr;

use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const ENV_PREFIX: &str = "STAFFLINE";
pub const DEFAULT_FILE: &str = "staffline";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("could not load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub listen_addr: String,
    /// Base URL of the gateway bridge's REST API.
    pub gateway_url: String,
    pub gateway_token: SecretString,
    /// The bot account's user id on the chat platform.
    pub bot_id: u64,
    /// Argon2 PHC hash of the operator key. Without it every operator
    /// route is refused.
    #[serde(default)]
    pub operator_key_hash: Option<SecretString>,
    pub log_level: String,
    /// Emit logs as JSON lines instead of the human-readable format.
    #[serde(default)]
    pub log_json: bool,
}

impl Settings {
    /// Loads `.env`, `staffline.toml` and the environment.
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let config = Self::defaults()?
            .add_source(File::with_name(DEFAULT_FILE).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, SettingsError> {
        Ok(Config::builder()
            .set_default("database_url", "sqlite:staffline.db")?
            .set_default("listen_addr", "127.0.0.1:8080")?
            .set_default("log_level", "info")?)
    }

    pub fn from_config(config: Config) -> Result<Self, SettingsError> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, SettingsError> {
        self.listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| SettingsError::Invalid {
                key: "listen_addr",
                reason: e.to_string(),
            })
    }

    fn validate(&self) -> Result<(), SettingsError> {
        self.listen_addr()?;
        if self.gateway_url.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "gateway_url",
                reason: "must not be empty".into(),
            });
        }
        if self.database_url.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "database_url",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use secrecy::ExposeSecret;

    fn from_toml(toml: &str) -> Result<Settings, SettingsError> {
        let config = Settings::defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Settings::from_config(config)
    }

    #[test]
    fn test_defaults_fill_optional_fields() {
        let settings = from_toml(
            r#"
            gateway_url = "http://127.0.0.1:7070"
            gateway_token = "s3cret"
            bot_id = 1234
            "#,
        )
        .unwrap();
        assert_eq!(settings.database_url, "sqlite:staffline.db");
        assert_eq!(settings.log_level, "info");
        assert!(!settings.log_json);
        assert_eq!(settings.listen_addr().unwrap().port(), 8080);
        assert_eq!(settings.gateway_token.expose_secret(), "s3cret");
        assert!(settings.operator_key_hash.is_none());
    }

    #[test]
    fn test_missing_gateway_is_an_error() {
        assert!(matches!(
            from_toml("bot_id = 1"),
            Err(SettingsError::Load(_))
        ));
    }

    #[test]
    fn test_bad_listen_addr_is_rejected() {
        let err = from_toml(
            r#"
            gateway_url = "http://bridge"
            gateway_token = "t"
            bot_id = 1
            listen_addr = "localhost"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "listen_addr", .. }));
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let settings = from_toml(
            r#"
            gateway_url = "http://bridge"
            gateway_token = "hunter2"
            bot_id = 1
            operator_key_hash = "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA"
            "#,
        )
        .unwrap();
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("argon2id"));
    }
}
