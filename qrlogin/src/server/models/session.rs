use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{LoginFlow, PublicIdentity, SessionStatus};

/// External identity reported by the callback channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// WeChat openid (or whatever the provider keys users on).
    pub external_id: String,
    pub name: String,
    pub avatar: Option<String>,
}

impl Identity {
    /// Two reports describe the same login if they name the same external user.
    pub fn same_subject(&self, other: &Identity) -> bool {
        self.external_id == other.external_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginSession {
    pub session_id: String,
    pub flow: LoginFlow,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub identity: Option<Identity>,
    pub resolved_user_id: Option<String>,
}

impl LoginSession {
    pub fn new(
        session_id: String,
        flow: LoginFlow,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            session_id,
            flow,
            status: SessionStatus::Pending,
            created_at: now,
            expire_time: now + ttl,
            identity: None,
            resolved_user_id: None,
        }
    }

    /// Expiry is derived from the clock, never trusted from `status` alone.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Expired || now > self.expire_time
    }

    /// Copy of this session moved to `expired`, with any half-finished
    /// identity dropped so only scanned/success sessions carry one.
    pub fn into_expired(mut self) -> Self {
        self.status = SessionStatus::Expired;
        self.identity = None;
        self.resolved_user_id = None;
        self
    }
}

/// Returned to the poller when a session is created
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub expire_time: DateTime<Utc>,
}

/// What a poll is allowed to see
#[derive(Debug, Clone)]
pub struct SessionView {
    pub status: SessionStatus,
    pub identity: Option<PublicIdentity>,
    pub token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl SessionView {
    pub fn bare(status: SessionStatus) -> Self {
        Self {
            status,
            identity: None,
            token: None,
            token_expires_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> LoginSession {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        LoginSession::new(
            "s1".to_string(),
            LoginFlow::MiniProgram,
            t0,
            chrono::Duration::minutes(5),
        )
    }

    #[test]
    fn new_session_is_pending_with_ttl() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Pending);
        assert_eq!(s.expire_time - s.created_at, chrono::Duration::minutes(5));
        assert!(s.identity.is_none());
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let s = session();
        assert!(!s.is_expired_at(s.expire_time));
        assert!(s.is_expired_at(s.expire_time + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn expiring_clears_identity() {
        let mut s = session();
        s.status = SessionStatus::Scanned;
        s.identity = Some(Identity {
            external_id: "o-1".into(),
            name: "A".into(),
            avatar: None,
        });
        s.resolved_user_id = Some("u-1".into());

        let expired = s.into_expired();
        assert_eq!(expired.status, SessionStatus::Expired);
        assert!(expired.identity.is_none());
        assert!(expired.resolved_user_id.is_none());
    }
}
