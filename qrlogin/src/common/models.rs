use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a QR login session as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Scanned,
    /// Older clients of the official-account flow call this `confirmed`.
    #[serde(alias = "confirmed")]
    Success,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanned => "scanned",
            Self::Success => "success",
            Self::Expired => "expired",
        }
    }

    /// No transition is defined out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Expired)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scanned" => Ok(Self::Scanned),
            "success" | "confirmed" => Ok(Self::Success),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// Which channel completes the login.
///
/// `WeChat` sessions stop at `scanned` until an explicit confirm;
/// `MiniProgram` sessions go straight to `success` on the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoginFlow {
    #[serde(rename = "wechat")]
    WeChat,
    #[default]
    #[serde(rename = "mini_program")]
    MiniProgram,
}

impl LoginFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeChat => "wechat",
            Self::MiniProgram => "mini_program",
        }
    }
}

impl FromStr for LoginFlow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wechat" => Ok(Self::WeChat),
            "mini_program" => Ok(Self::MiniProgram),
            other => Err(format!("unknown login flow: {}", other)),
        }
    }
}

/// Profile fields that may be shown to the browser once login succeeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

// POST /auth/qrcode-session
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<LoginFlow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub expire_time: DateTime<Utc>,
}

// GET /auth/login-status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStatusResponse {
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PublicIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_lowercase_wire_names() {
        let json = serde_json::to_string(&SessionStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");
        let json = serde_json::to_string(&SessionStatus::Scanned).unwrap();
        assert_eq!(json, "\"scanned\"");
    }

    #[test]
    fn confirmed_is_read_as_success() {
        let status: SessionStatus = serde_json::from_str("\"confirmed\"").unwrap();
        assert_eq!(status, SessionStatus::Success);
        assert_eq!("confirmed".parse::<SessionStatus>(), Ok(SessionStatus::Success));
    }

    #[test]
    fn only_success_and_expired_are_terminal() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Scanned.is_terminal());
        assert!(SessionStatus::Success.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }

    #[test]
    fn pending_status_response_omits_token_and_identity() {
        let resp = LoginStatusResponse {
            status: SessionStatus::Pending,
            identity: None,
            token: None,
            token_expires_at: None,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value, serde_json::json!({ "status": "pending" }));
    }

    #[test]
    fn flow_round_trips_through_str() {
        for flow in [LoginFlow::WeChat, LoginFlow::MiniProgram] {
            assert_eq!(flow.as_str().parse::<LoginFlow>(), Ok(flow));
        }
        assert!("sms".parse::<LoginFlow>().is_err());
    }
}
