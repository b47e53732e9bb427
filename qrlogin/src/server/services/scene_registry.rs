use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::session_store::{CasOutcome, SessionStore, StoreError};
use crate::common::SessionStatus;
use crate::server::models::LoginSession;

/// Process-local session backend keyed by scene string.
///
/// Created at startup and owned by the app state; everything is lost on
/// restart, which is acceptable for five-minute sessions. DashMap's
/// per-shard locks make each call atomic for its key.
#[derive(Default)]
pub struct SceneRegistry {
    scenes: DashMap<String, LoginSession>,
}

impl SceneRegistry {
    pub fn new() -> Self {
        tracing::info!("Scene registry initialized");
        Self {
            scenes: DashMap::new(),
        }
    }

    /// Get session count (for monitoring)
    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

impl SessionStore for SceneRegistry {
    async fn insert(&self, session: LoginSession) -> Result<(), StoreError> {
        match self.scenes.entry(session.session_id.clone()) {
            Entry::Occupied(entry) => Err(StoreError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(session_id = %session.session_id, "Registered scene");
                entry.insert(session);
                Ok(())
            }
        }
    }

    async fn get(&self, session_id: &str) -> Result<Option<LoginSession>, StoreError> {
        Ok(self.scenes.get(session_id).map(|s| s.clone()))
    }

    async fn compare_and_set(
        &self,
        expected: SessionStatus,
        next: LoginSession,
    ) -> Result<CasOutcome, StoreError> {
        let Some(mut current) = self.scenes.get_mut(&next.session_id) else {
            return Ok(CasOutcome::Mismatch(None));
        };

        if current.status != expected {
            return Ok(CasOutcome::Mismatch(Some(current.clone())));
        }

        *current = next;
        Ok(CasOutcome::Applied)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let initial_count = self.scenes.len();

        self.scenes.retain(|session_id, session| {
            if session.expire_time < now {
                tracing::debug!(session_id = %session_id, "Cleaning up expired scene");
                false
            } else {
                true
            }
        });

        Ok(initial_count.saturating_sub(self.scenes.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LoginFlow;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn pending(id: &str) -> LoginSession {
        LoginSession::new(
            id.to_string(),
            LoginFlow::WeChat,
            t0(),
            chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn insert_is_create_if_absent() {
        let registry = SceneRegistry::new();
        registry.insert(pending("scene-1")).await.unwrap();

        let err = registry.insert(pending("scene-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "scene-1"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_set_applies_only_on_matching_status() {
        let registry = SceneRegistry::new();
        registry.insert(pending("scene-1")).await.unwrap();

        let mut scanned = pending("scene-1");
        scanned.status = SessionStatus::Scanned;

        let outcome = registry
            .compare_and_set(SessionStatus::Pending, scanned.clone())
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Applied);

        // A second writer still believing the session is pending loses.
        let mut expired = pending("scene-1");
        expired.status = SessionStatus::Expired;
        let outcome = registry
            .compare_and_set(SessionStatus::Pending, expired)
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Mismatch(Some(scanned.clone())));
        assert_eq!(registry.get("scene-1").await.unwrap(), Some(scanned));
    }

    #[tokio::test]
    async fn compare_and_set_on_missing_scene() {
        let registry = SceneRegistry::new();
        let outcome = registry
            .compare_and_set(SessionStatus::Pending, pending("ghost"))
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Mismatch(None));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn purge_keeps_live_scenes() {
        let registry = SceneRegistry::new();
        registry.insert(pending("old")).await.unwrap();
        let mut fresh = pending("fresh");
        fresh.expire_time = t0() + chrono::Duration::minutes(30);
        registry.insert(fresh).await.unwrap();

        let purged = registry
            .purge_expired(t0() + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(registry.get("old").await.unwrap().is_none());
        assert!(registry.get("fresh").await.unwrap().is_some());
    }
}
