use serde::Deserialize;

use crate::server::error::ServerError;

const MIN_TOKEN_SECRET_LEN: usize = 32;

#[derive(Debug, Deserialize, Clone)]
pub struct Configuration {
    #[serde(default)]
    pub server: ServerConfiguration,
    #[serde(default)]
    pub session: SessionConfiguration,
    pub token: TokenConfiguration,
    pub wechat: Option<WeChatConfiguration>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfiguration {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Browser origins allowed to call the API cross-origin (toml list)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Where login sessions live and how long they stay valid
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfiguration {
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,

    #[serde(default)]
    pub backend: StoreBackendKind,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Shared secret the callback channel must present in `X-Callback-Secret`.
    #[serde(default)]
    pub callback_secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfiguration {
    pub secret: String,

    #[serde(default = "default_token_ttl_days")]
    pub ttl_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeChatConfiguration {
    pub app_id: String,
    pub app_secret: String,

    #[serde(default = "default_code2session_url")]
    pub code2session_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_body_bytes() -> usize {
    16 * 1024
}

fn default_session_ttl() -> u64 {
    300
}

fn default_sqlite_path() -> String {
    "qrlogin.db".to_string()
}

fn default_store_timeout() -> u64 {
    2000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_token_ttl_days() -> i64 {
    7
}

fn default_code2session_url() -> String {
    "https://api.weixin.qq.com/sns/jscode2session".to_string()
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl(),
            backend: StoreBackendKind::default(),
            sqlite_path: default_sqlite_path(),
            store_timeout_ms: default_store_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            callback_secret: None,
        }
    }
}

impl Configuration {
    pub fn new() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if std::path::Path::new("config.toml").exists() {
            builder = builder.add_source(config::File::with_name("config"));
        }

        builder = builder.add_source(config::Environment::with_prefix("QRLOGIN").separator("__"));

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.token.secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(ServerError::Configuration(format!(
                "token.secret must be at least {} bytes",
                MIN_TOKEN_SECRET_LEN
            )));
        }
        if self.token.ttl_days <= 0 {
            return Err(ServerError::Configuration(
                "token.ttl_days must be positive".to_string(),
            ));
        }
        if self.session.ttl_seconds == 0 {
            return Err(ServerError::Configuration(
                "session.ttl_seconds must be positive".to_string(),
            ));
        }
        if self.session.store_timeout_ms == 0 {
            return Err(ServerError::Configuration(
                "session.store_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(origin) = self
            .server
            .allowed_origins
            .iter()
            .find(|o| o.parse::<axum::http::HeaderValue>().is_err())
        {
            return Err(ServerError::Configuration(format!(
                "server.allowed_origins contains an invalid origin: {}",
                origin
            )));
        }
        if matches!(&self.session.callback_secret, Some(s) if s.is_empty()) {
            return Err(ServerError::Configuration(
                "session.callback_secret must not be empty when set".to_string(),
            ));
        }
        // Without a code exchange the callback's claimed identity is taken on
        // trust, so only the shared secret keeps anonymous callers out.
        if self.wechat.is_none() && self.session.callback_secret.is_none() {
            return Err(ServerError::Configuration(
                "session.callback_secret is required when no [wechat] section is configured"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
