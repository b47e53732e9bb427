use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::Settings;
use crate::common::{
    CreateSessionRequest, CreateSessionResponse, LoginFlow, LoginStatusResponse, PublicIdentity,
    SessionStatus,
};
use crate::error::LoginError;

const POLL_TIMEOUT_SECS: u64 = 300; // Never wait longer than one session TTL
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Credential handed back once the scan has been confirmed
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub token: String,
    pub identity: PublicIdentity,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Polls the login server on behalf of a browser or terminal
pub struct LoginClient {
    http_client: Client,
    server_url: String,
    poll_interval: Duration,
}

impl LoginClient {
    pub fn new(settings: &Settings) -> Result<Self, LoginError> {
        settings.validate().map_err(LoginError::Configuration)?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http_client,
            server_url: settings.server_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        })
    }

    pub async fn create_session(
        &self,
        flow: LoginFlow,
    ) -> Result<CreateSessionResponse, LoginError> {
        let url = format!("{}/auth/qrcode-session", self.server_url);
        let req = CreateSessionRequest { flow: Some(flow) };

        let resp = self
            .http_client
            .post(&url)
            .json(&req)
            .send()
            .await?
            .error_for_status()?
            .json::<CreateSessionResponse>()
            .await?;

        tracing::debug!(session_id = %resp.session_id, "Created login session");
        Ok(resp)
    }

    pub async fn login_status(&self, session_id: &str) -> Result<LoginStatusResponse, LoginError> {
        let url = format!("{}/auth/login-status", self.server_url);

        let resp = self
            .http_client
            .get(&url)
            .query(&[("sessionId", session_id)])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(LoginError::Server(format!(
                "Unknown login session {}",
                session_id
            )));
        }

        Ok(resp.error_for_status()?.json::<LoginStatusResponse>().await?)
    }

    /// Poll until the session succeeds or expires
    pub async fn wait_for_login(
        &self,
        session: &CreateSessionResponse,
    ) -> Result<LoginGrant, LoginError> {
        let start = std::time::Instant::now();
        let ceiling = Duration::from_secs(POLL_TIMEOUT_SECS);

        loop {
            if start.elapsed() > ceiling {
                return Err(LoginError::Timeout);
            }

            let resp = self.login_status(&session.session_id).await?;

            match resp.status {
                SessionStatus::Success => {
                    let token = resp
                        .token
                        .ok_or_else(|| LoginError::Server("Missing token".into()))?;
                    let identity = resp
                        .identity
                        .ok_or_else(|| LoginError::Server("Missing identity".into()))?;
                    return Ok(LoginGrant {
                        token,
                        identity,
                        expires_at: resp.token_expires_at,
                    });
                }
                SessionStatus::Expired => {
                    return Err(LoginError::SessionExpired);
                }
                SessionStatus::Pending | SessionStatus::Scanned => {
                    // The server is authoritative on expiry, but there is no
                    // point polling far past the advertised deadline.
                    if Utc::now() > session.expire_time + chrono::Duration::seconds(30) {
                        return Err(LoginError::SessionExpired);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
