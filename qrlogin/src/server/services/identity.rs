use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::server::config::WeChatConfiguration;

const EXCHANGE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("callback carried no external identity")]
    MissingIdentity,

    #[error("callback identity {claimed} does not match exchanged identity {resolved}")]
    Mismatch { claimed: String, resolved: String },

    #[error("code exchange failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("code exchange rejected ({code}): {message}")]
    Upstream { code: i64, message: String },
}

/// Turns the auth code from the callback channel into an external user id.
pub trait IdentityProvider: Send + Sync + 'static {
    /// `claimed` is the external id the callback says it is reporting, if any.
    fn exchange(
        &self,
        code: &str,
        claimed: Option<&str>,
    ) -> impl Future<Output = Result<String, IdentityError>> + Send;
}

/// Resolves codes against the WeChat `code2session` endpoint
pub struct WeChatIdentityProvider {
    http_client: Client,
    app_id: String,
    app_secret: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct Code2SessionResponse {
    openid: Option<String>,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

impl WeChatIdentityProvider {
    pub fn new(config: &WeChatConfiguration) -> Result<Self, IdentityError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http_client,
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            endpoint: config.code2session_url.clone(),
        })
    }
}

impl IdentityProvider for WeChatIdentityProvider {
    async fn exchange(&self, code: &str, claimed: Option<&str>) -> Result<String, IdentityError> {
        let resp = self
            .http_client
            .get(&self.endpoint)
            .query(&[
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
                ("js_code", code),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<Code2SessionResponse>()
            .await?;

        let openid = match resp.openid {
            Some(openid) if resp.errcode == 0 => openid,
            _ => {
                return Err(IdentityError::Upstream {
                    code: resp.errcode,
                    message: resp.errmsg,
                })
            }
        };

        check_claim(claimed, openid)
    }
}

/// Accepts the external id reported by a callback channel that is already
/// authenticated by the shared callback secret. Used when no WeChat
/// credentials are configured.
#[derive(Debug, Default)]
pub struct TrustedCallbackProvider;

impl IdentityProvider for TrustedCallbackProvider {
    async fn exchange(&self, _code: &str, claimed: Option<&str>) -> Result<String, IdentityError> {
        claimed
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or(IdentityError::MissingIdentity)
    }
}

fn check_claim(claimed: Option<&str>, resolved: String) -> Result<String, IdentityError> {
    match claimed {
        Some(claimed) if claimed != resolved => Err(IdentityError::Mismatch {
            claimed: claimed.to_string(),
            resolved,
        }),
        _ => Ok(resolved),
    }
}

/// Identity provider selected by whether `[wechat]` is configured
pub enum IdentityBackend {
    WeChat(WeChatIdentityProvider),
    Trusted(TrustedCallbackProvider),
}

impl IdentityBackend {
    pub fn from_config(config: Option<&WeChatConfiguration>) -> Result<Self, IdentityError> {
        match config {
            Some(wechat) => {
                tracing::info!(app_id = %wechat.app_id, "Using WeChat code exchange");
                Ok(Self::WeChat(WeChatIdentityProvider::new(wechat)?))
            }
            None => {
                tracing::warn!("No [wechat] section configured, trusting callback identities");
                Ok(Self::Trusted(TrustedCallbackProvider))
            }
        }
    }
}

impl IdentityProvider for IdentityBackend {
    async fn exchange(&self, code: &str, claimed: Option<&str>) -> Result<String, IdentityError> {
        match self {
            Self::WeChat(provider) => provider.exchange(code, claimed).await,
            Self::Trusted(provider) => provider.exchange(code, claimed).await,
        }
    }
}
