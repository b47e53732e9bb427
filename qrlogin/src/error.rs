use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Login timed out before the session resolved")]
    Timeout,

    #[error("Login session expired")]
    SessionExpired,

    #[error("Server error: {0}")]
    Server(String),
}

impl From<config::ConfigError> for LoginError {
    fn from(err: config::ConfigError) -> Self {
        LoginError::Configuration(err.to_string())
    }
}
