// ============================
// yarn-backend-lib/src/config.rs
// ============================
//! Configuration management.
use crate::error::AppError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `YARN_RELAY_BIND_ADDR`.
pub const ENV_PREFIX: &str = "YARN_RELAY_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level, used when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Upper bound on a single outbound delivery, in milliseconds
    pub send_timeout_ms: u64,
    /// Outbound frames buffered per connection
    pub channel_capacity: usize,
    /// Name used when a client joins without `display_name`
    pub default_display_name: String,
    /// Allowed CORS origins; `*` allows any
    pub cors_allowed_origins: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            send_timeout_ms: 5_000,
            channel_capacity: 32,
            default_display_name: "Guest".to_string(),
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

impl Settings {
    /// Load settings from defaults and `YARN_RELAY_*` environment variables.
    pub fn load() -> Result<Self, AppError> {
        Self::checked(Self::figment(None).extract::<Settings>()?)
    }

    /// Load settings from a TOML file layered over defaults, then environment.
    ///
    /// # Errors
    /// [`AppError::Io`] when `path` can't be read, [`AppError::InvalidConfig`]
    /// when a value doesn't parse or fails validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        // an explicitly named file must exist
        std::fs::metadata(path)?;
        Self::checked(Self::figment(Some(path)).extract::<Settings>()?)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    fn checked(settings: Self) -> Result<Self, AppError> {
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(AppError::InvalidConfig(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        if self.send_timeout_ms == 0 {
            return Err(AppError::InvalidConfig(
                "send_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.default_display_name.trim().is_empty() {
            return Err(AppError::InvalidConfig(
                "default_display_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_settings_validation() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());

        let mut invalid = settings.clone();
        invalid.log_level = "loud".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = settings.clone();
        invalid.send_timeout_ms = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = settings.clone();
        invalid.channel_capacity = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = settings;
        invalid.default_display_name = "  ".to_string();
        assert!(matches!(invalid.validate(), Err(AppError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "relay.toml",
                r#"
bind_addr = "0.0.0.0:9100"
log_format = "json"
send_timeout_ms = 250
cors_allowed_origins = ["http://localhost:5173"]
"#,
            )?;

            let settings = Settings::load_from("relay.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.bind_addr.to_string(), "0.0.0.0:9100");
            assert_eq!(settings.log_format, LogFormat::Json);
            assert_eq!(settings.send_timeout(), Duration::from_millis(250));
            assert_eq!(settings.cors_allowed_origins, vec!["http://localhost:5173"]);
            // untouched keys keep their defaults
            assert_eq!(settings.channel_capacity, 32);
            assert_eq!(settings.default_display_name, "Guest");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.create_file("relay.toml", "send_timeout_ms = 250\nchannel_capacity = 8")?;
            jail.set_env("YARN_RELAY_SEND_TIMEOUT_MS", 1500);

            let settings = Settings::load_from("relay.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.send_timeout(), Duration::from_millis(1500));
            assert_eq!(settings.channel_capacity, 8);
            Ok(())
        });
    }

    #[test]
    fn test_load_reads_env_over_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("YARN_RELAY_DEFAULT_DISPLAY_NAME", "Visitor");
            jail.set_env("YARN_RELAY_LOG_LEVEL", "debug");

            let settings = Settings::load().map_err(|e| e.to_string())?;
            assert_eq!(settings.default_display_name, "Visitor");
            assert_eq!(settings.log_level, "debug");
            assert_eq!(settings.bind_addr, Settings::default().bind_addr);
            Ok(())
        });
    }

    #[test]
    fn test_load_from_rejects_invalid_values() {
        Jail::expect_with(|jail| {
            jail.create_file("relay.toml", "channel_capacity = 0")?;
            let err = Settings::load_from("relay.toml").unwrap_err();
            assert!(matches!(err, AppError::InvalidConfig(_)));

            jail.create_file("typo.toml", "send_timeout_ms = \"soon\"")?;
            let err = Settings::load_from("typo.toml").unwrap_err();
            assert!(matches!(err, AppError::InvalidConfig(_)));
            Ok(())
        });
    }

    #[test]
    fn test_load_from_missing_file_is_io_error() {
        Jail::expect_with(|_jail| {
            let err = Settings::load_from("nowhere.toml").unwrap_err();
            assert!(matches!(err, AppError::Io(_)));
            Ok(())
        });
    }
}
