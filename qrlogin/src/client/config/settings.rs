use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("QRLOGIN_CLIENT_CONFIG").unwrap_or_else(|_| "client.toml".to_string());

        let settings = Config::builder()
            .add_source(File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("QRLOGIN_CLIENT").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("server_url is required".to_string());
        }
        if !self.server_url.starts_with("http") {
            return Err("server_url must be a valid HTTP(S) URL".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_http_url() {
        let settings = Settings {
            server_url: "localhost:8080".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let settings = Settings {
            poll_interval_ms: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
