use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::SessionStatus;

// GET /auth/login-status
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStatusParams {
    pub session_id: String,
}

// POST /auth/callback
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub session_id: String,
    pub external_code: String,
    pub identity: CallbackIdentity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackIdentity {
    /// Optional when a real code exchange resolves the external id.
    #[serde(default)]
    pub external_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub status: SessionStatus,
}

// POST /auth/confirm
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub session_id: String,
}

// GET /auth/me
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileResponse {
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

// Health check
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
