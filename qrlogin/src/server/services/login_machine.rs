use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::clock::Clock;
use super::session_store::{generate_session_id, CasOutcome, SessionStore, StoreError};
use super::token_issuer::{SigningError, TokenIssuer};
use super::user_store::UserStore;
use crate::common::{LoginFlow, PublicIdentity, SessionStatus};
use crate::server::models::{
    Identity, LoginSession, SessionHandle, SessionView, UserRecord, UserRef,
};

/// A lost compare-and-set means someone else moved the session; re-read and
/// decide again, but never loop forever.
const MAX_CAS_ATTEMPTS: usize = 4;
const MAX_ID_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LoginFlowError {
    #[error("login session {0} not found")]
    NotFound(String),

    #[error("login session {0} expired")]
    Expired(String),

    #[error("{0}")]
    Conflict(String),

    #[error("cannot move session from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("inconsistent session: {0}")]
    Inconsistent(String),

    #[error("user {0} not found")]
    UnknownUser(String),
}

#[derive(Debug, Clone, Copy)]
pub struct MachineSettings {
    pub session_ttl: chrono::Duration,
    pub store_timeout: Duration,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            session_ttl: chrono::Duration::minutes(5),
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Drives QR login sessions through `pending → scanned → success`, with
/// `expired` reachable from any non-terminal state.
///
/// The browser's poll and the messaging channel's callback race on the same
/// record. Every status change is a compare-and-set against the status that
/// was read, and expiry is recomputed from the clock on every access.
pub struct LoginSessionMachine<S, U> {
    store: Arc<S>,
    users: Arc<U>,
    tokens: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    settings: MachineSettings,
}

impl<S: SessionStore, U: UserStore> LoginSessionMachine<S, U> {
    pub fn new(
        store: Arc<S>,
        users: Arc<U>,
        tokens: Arc<TokenIssuer>,
        clock: Arc<dyn Clock>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            store,
            users,
            tokens,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn tokens(&self) -> &Arc<TokenIssuer> {
        &self.tokens
    }

    /// Bound a store call so a stuck backend surfaces as an error
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.settings.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.settings.store_timeout))?
    }

    async fn load(&self, session_id: &str) -> Result<LoginSession, LoginFlowError> {
        self.bounded(self.store.get(session_id))
            .await?
            .ok_or_else(|| LoginFlowError::NotFound(session_id.to_string()))
    }

    /// Start a new pending session
    pub async fn create(&self, flow: LoginFlow) -> Result<SessionHandle, LoginFlowError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let session = LoginSession::new(
                generate_session_id(),
                flow,
                self.clock.now(),
                self.settings.session_ttl,
            );
            let handle = SessionHandle {
                session_id: session.session_id.clone(),
                expire_time: session.expire_time,
            };

            match self.bounded(self.store.insert(session)).await {
                Ok(()) => {
                    tracing::info!(
                        session_id = %handle.session_id,
                        flow = flow.as_str(),
                        "Created login session"
                    );
                    return Ok(handle);
                }
                Err(StoreError::AlreadyExists(id)) => {
                    tracing::warn!(session_id = %id, "Session id collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LoginFlowError::Store(StoreError::Backend(
            "could not allocate a unique session id".to_string(),
        )))
    }

    /// Record the identity reported by the callback channel.
    ///
    /// A repeat of the same identity is accepted without change; a different
    /// identity for an already-resolved session is a conflict.
    pub async fn report_callback(
        &self,
        session_id: &str,
        identity: Identity,
    ) -> Result<LoginSession, LoginFlowError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load(session_id).await?;

            if current.is_expired_at(self.clock.now()) {
                self.expire(current).await;
                return Err(LoginFlowError::Expired(session_id.to_string()));
            }

            match current.status {
                SessionStatus::Pending => {}
                SessionStatus::Scanned | SessionStatus::Success => {
                    return match &current.identity {
                        Some(existing) if existing.same_subject(&identity) => {
                            tracing::debug!(session_id = %session_id, "Duplicate callback ignored");
                            Ok(current)
                        }
                        _ => {
                            tracing::warn!(
                                session_id = %session_id,
                                "Callback tried to replace a resolved identity"
                            );
                            Err(LoginFlowError::Conflict(format!(
                                "login session {} is already bound to another identity",
                                session_id
                            )))
                        }
                    };
                }
                SessionStatus::Expired => {
                    return Err(LoginFlowError::Expired(session_id.to_string()));
                }
            }

            let user = self.resolve_identity(&identity).await?;

            let mut next = current.clone();
            next.status = match current.flow {
                LoginFlow::WeChat => SessionStatus::Scanned,
                LoginFlow::MiniProgram => SessionStatus::Success,
            };
            next.identity = Some(identity.clone());
            next.resolved_user_id = Some(user.user_id);

            match self
                .bounded(self.store.compare_and_set(SessionStatus::Pending, next.clone()))
                .await?
            {
                CasOutcome::Applied => {
                    tracing::info!(
                        session_id = %session_id,
                        status = %next.status,
                        "Login callback applied"
                    );
                    return Ok(next);
                }
                CasOutcome::Mismatch(None) => {
                    return Err(LoginFlowError::NotFound(session_id.to_string()));
                }
                CasOutcome::Mismatch(Some(_)) => {
                    tracing::debug!(session_id = %session_id, "Lost callback race, re-reading");
                }
            }
        }

        Err(LoginFlowError::Conflict(format!(
            "login session {} kept changing under the callback",
            session_id
        )))
    }

    /// Find or create the local user for an external identity, refreshing
    /// the display profile on every login.
    pub async fn resolve_identity(&self, identity: &Identity) -> Result<UserRef, LoginFlowError> {
        let user = self
            .bounded(self.users.find_or_create(identity, self.clock.now()))
            .await?;
        Ok(UserRef::from(&user))
    }

    /// Stored account behind a verified token
    pub async fn user(&self, user_id: &str) -> Result<UserRecord, LoginFlowError> {
        self.bounded(self.users.find_by_id(user_id))
            .await?
            .ok_or_else(|| LoginFlowError::UnknownUser(user_id.to_string()))
    }

    /// What the browser sees when it polls.
    ///
    /// Only a successful session carries an identity and a token.
    pub async fn poll(&self, session_id: &str) -> Result<SessionView, LoginFlowError> {
        let current = self.load(session_id).await?;

        if current.is_expired_at(self.clock.now()) {
            self.expire(current).await;
            return Ok(SessionView::bare(SessionStatus::Expired));
        }

        if current.status != SessionStatus::Success {
            return Ok(SessionView::bare(current.status));
        }

        let user = self.success_user(&current)?;
        let token = self.tokens.issue(&user)?;

        tracing::info!(session_id = %session_id, user_id = %user.user_id, "Login session resolved");

        Ok(SessionView {
            status: SessionStatus::Success,
            identity: Some(PublicIdentity::from(user)),
            token: Some(token.value),
            token_expires_at: Some(token.expires_at),
        })
    }

    /// Explicit completion step for the WeChat flow: `scanned → success`.
    pub async fn confirm(&self, session_id: &str) -> Result<LoginSession, LoginFlowError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load(session_id).await?;

            if current.is_expired_at(self.clock.now()) {
                self.expire(current).await;
                return Err(LoginFlowError::Expired(session_id.to_string()));
            }

            match current.status {
                SessionStatus::Scanned => {}
                SessionStatus::Success => return Ok(current),
                SessionStatus::Pending => {
                    return Err(LoginFlowError::InvalidTransition {
                        from: SessionStatus::Pending,
                        to: SessionStatus::Success,
                    })
                }
                SessionStatus::Expired => {
                    return Err(LoginFlowError::Expired(session_id.to_string()))
                }
            }

            let mut next = current.clone();
            next.status = SessionStatus::Success;

            match self
                .bounded(self.store.compare_and_set(SessionStatus::Scanned, next.clone()))
                .await?
            {
                CasOutcome::Applied => {
                    tracing::info!(session_id = %session_id, "Login session confirmed");
                    return Ok(next);
                }
                CasOutcome::Mismatch(None) => {
                    return Err(LoginFlowError::NotFound(session_id.to_string()));
                }
                CasOutcome::Mismatch(Some(_)) => {}
            }
        }

        Err(LoginFlowError::Conflict(format!(
            "login session {} kept changing under confirm",
            session_id
        )))
    }

    /// Write `expired` through for a session whose deadline has passed.
    ///
    /// Terminal sessions are left as stored; readers already treat them as
    /// expired. A failed or lost write is harmless for the same reason.
    async fn expire(&self, current: LoginSession) {
        if current.status.is_terminal() {
            return;
        }

        let session_id = current.session_id.clone();
        let expected = current.status;
        match self
            .bounded(self.store.compare_and_set(expected, current.into_expired()))
            .await
        {
            Ok(CasOutcome::Applied) => {
                tracing::info!(session_id = %session_id, "Login session expired");
            }
            Ok(CasOutcome::Mismatch(_)) => {
                tracing::debug!(session_id = %session_id, "Session changed before expiry write");
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Could not persist expiry");
            }
        }
    }

    fn success_user(&self, session: &LoginSession) -> Result<UserRef, LoginFlowError> {
        match (&session.identity, &session.resolved_user_id) {
            (Some(identity), Some(user_id)) => Ok(UserRef {
                user_id: user_id.clone(),
                name: identity.name.clone(),
                avatar: identity.avatar.clone(),
            }),
            _ => Err(LoginFlowError::Inconsistent(format!(
                "session {} succeeded without a resolved user",
                session.session_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::services::clock::ManualClock;
    use crate::server::services::scene_registry::SceneRegistry;
    use crate::server::services::sqlite_store::SqliteStore;
    use crate::server::services::user_store::MemoryUserStore;
    use chrono::{TimeZone, Utc};

    type MemoryMachine = LoginSessionMachine<SceneRegistry, MemoryUserStore>;

    fn identity(external_id: &str, name: &str) -> Identity {
        Identity {
            external_id: external_id.to_string(),
            name: name.to_string(),
            avatar: Some(format!("https://img.example/{}.png", name)),
        }
    }

    fn machine() -> (Arc<ManualClock>, MemoryMachine) {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let tokens = Arc::new(TokenIssuer::new(
            "unit-test-secret-unit-test-secret",
            chrono::Duration::days(7),
            clock.clone(),
        ));
        let machine = LoginSessionMachine::new(
            Arc::new(SceneRegistry::new()),
            Arc::new(MemoryUserStore::new()),
            tokens,
            clock.clone(),
            MachineSettings::default(),
        );
        (clock, machine)
    }

    #[tokio::test]
    async fn create_then_poll_is_pending() {
        let (_clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();

        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Pending);
        assert!(view.token.is_none());
        assert!(view.identity.is_none());
    }

    #[tokio::test]
    async fn session_expires_five_minutes_after_creation() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();
        assert_eq!(handle.expire_time, clock.now() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn mini_program_callback_then_poll_returns_token() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();

        clock.advance(chrono::Duration::minutes(1));
        let session = machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Success);

        clock.advance(chrono::Duration::minutes(1));
        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Success);
        let public = view.identity.unwrap();
        assert_eq!(public.name, "A");
        assert_eq!(Some(public.user_id.clone()), session.resolved_user_id);

        let claims = machine.tokens().verify(&view.token.unwrap()).unwrap();
        assert_eq!(claims.user_id, public.user_id);
    }

    #[tokio::test]
    async fn poll_without_callback_after_six_minutes_is_expired() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();

        clock.advance(chrono::Duration::minutes(6));
        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Expired);

        // Expiry was written through.
        let stored = machine
            .store()
            .get(&handle.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn expiry_wins_over_stored_success() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();
        machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(5) + chrono::Duration::seconds(1));
        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Expired);
        assert!(view.token.is_none());
    }

    #[tokio::test]
    async fn second_callback_with_other_identity_is_rejected() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();
        machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(2));
        let err = machine
            .report_callback(&handle.session_id, identity("o-b", "B"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoginFlowError::Conflict(_)));

        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.identity.unwrap().name, "A");
    }

    #[tokio::test]
    async fn duplicate_callback_is_idempotent() {
        let (_clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();

        let first = machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();
        let again = machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn late_callback_is_expired_and_not_applied() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();

        clock.advance(chrono::Duration::minutes(6));
        let err = machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoginFlowError::Expired(_)));

        let stored = machine
            .store()
            .get(&handle.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
        assert!(stored.identity.is_none());
    }

    #[tokio::test]
    async fn wechat_flow_needs_confirm() {
        let (_clock, machine) = machine();
        let handle = machine.create(LoginFlow::WeChat).await.unwrap();

        let err = machine.confirm(&handle.session_id).await.unwrap_err();
        assert!(matches!(
            err,
            LoginFlowError::InvalidTransition {
                from: SessionStatus::Pending,
                ..
            }
        ));

        let scanned = machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();
        assert_eq!(scanned.status, SessionStatus::Scanned);

        // Scanned is not success yet: no token.
        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Scanned);
        assert!(view.token.is_none());

        let confirmed = machine.confirm(&handle.session_id).await.unwrap();
        assert_eq!(confirmed.status, SessionStatus::Success);
        assert_eq!(confirmed.identity, scanned.identity);

        // Confirming twice is harmless.
        machine.confirm(&handle.session_id).await.unwrap();

        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Success);
        assert!(view.token.is_some());
    }

    #[tokio::test]
    async fn confirm_after_expiry_fails() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::WeChat).await.unwrap();
        machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(10));
        let err = machine.confirm(&handle.session_id).await.unwrap_err();
        assert!(matches!(err, LoginFlowError::Expired(_)));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_clock, machine) = machine();
        assert!(matches!(
            machine.poll("missing").await,
            Err(LoginFlowError::NotFound(_))
        ));
        assert!(matches!(
            machine.report_callback("missing", identity("o-a", "A")).await,
            Err(LoginFlowError::NotFound(_))
        ));
        assert!(matches!(
            machine.confirm("missing").await,
            Err(LoginFlowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_identity_refreshes_profile() {
        let (_clock, machine) = machine();
        let first = machine.resolve_identity(&identity("o-a", "A")).await.unwrap();
        let second = machine
            .resolve_identity(&identity("o-a", "A-renamed"))
            .await
            .unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(second.name, "A-renamed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callbacks_bind_exactly_one_identity() {
        let (_clock, machine) = machine();
        let machine = Arc::new(machine);

        for _ in 0..20 {
            let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();

            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let machine = machine.clone();
                    let id = handle.session_id.clone();
                    tokio::spawn(async move {
                        let who = format!("o-{}", i);
                        let result = machine.report_callback(&id, identity(&who, &who)).await;
                        (who, result)
                    })
                })
                .collect();

            let mut winners = Vec::new();
            for task in tasks {
                let (who, result) = task.await.unwrap();
                match result {
                    Ok(session) => {
                        // Ok only for the identity that actually got bound.
                        assert_eq!(session.identity.as_ref().unwrap().external_id, who);
                        winners.push(who);
                    }
                    Err(LoginFlowError::Conflict(_)) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            assert_eq!(winners.len(), 1);

            let stored = machine
                .store()
                .get(&handle.session_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.identity.unwrap().external_id, winners[0]);
        }
    }

    #[tokio::test]
    async fn sqlite_backend_follows_the_same_contract() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let store = SqliteStore::open_in_memory().unwrap();
        let machine = LoginSessionMachine::new(
            Arc::new(store.clone()),
            Arc::new(store),
            Arc::new(TokenIssuer::new(
                "unit-test-secret-unit-test-secret",
                chrono::Duration::days(7),
                clock.clone(),
            )),
            clock.clone(),
            MachineSettings::default(),
        );

        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();
        machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();
        assert!(matches!(
            machine
                .report_callback(&handle.session_id, identity("o-b", "B"))
                .await,
            Err(LoginFlowError::Conflict(_))
        ));

        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Success);
        assert_eq!(view.identity.unwrap().name, "A");

        clock.advance(chrono::Duration::minutes(6));
        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn poll_reports_token_expiry_and_stored_user() {
        let (clock, machine) = machine();
        let handle = machine.create(LoginFlow::MiniProgram).await.unwrap();
        machine
            .report_callback(&handle.session_id, identity("o-a", "A"))
            .await
            .unwrap();

        let view = machine.poll(&handle.session_id).await.unwrap();
        assert_eq!(
            view.token_expires_at,
            Some(clock.now() + chrono::Duration::days(7))
        );

        let user_id = view.identity.unwrap().user_id;
        let user = machine.user(&user_id).await.unwrap();
        assert_eq!(user.external_id, "o-a");
        assert_eq!(user.last_login_at, clock.now());

        assert!(matches!(
            machine.user("nobody").await,
            Err(LoginFlowError::UnknownUser(_))
        ));
    }

    /// A backend that never answers
    struct StalledStore;

    impl SessionStore for StalledStore {
        async fn insert(&self, _session: LoginSession) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn get(&self, _session_id: &str) -> Result<Option<LoginSession>, StoreError> {
            std::future::pending().await
        }

        async fn compare_and_set(
            &self,
            _expected: SessionStatus,
            _next: LoginSession,
        ) -> Result<CasOutcome, StoreError> {
            std::future::pending().await
        }

        async fn purge_expired(&self, _now: chrono::DateTime<Utc>) -> Result<usize, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_times_out_as_internal_error() {
        use crate::server::error::ServerError;
        use axum::{http::StatusCode, response::IntoResponse};

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
        ));
        let machine = LoginSessionMachine::new(
            Arc::new(StalledStore),
            Arc::new(MemoryUserStore::new()),
            Arc::new(TokenIssuer::new(
                "unit-test-secret-unit-test-secret",
                chrono::Duration::days(7),
                clock.clone(),
            )),
            clock,
            MachineSettings::default(),
        );

        assert!(matches!(
            machine.create(LoginFlow::MiniProgram).await,
            Err(LoginFlowError::Store(StoreError::Timeout(_)))
        ));

        let err = machine.poll("s-1").await.unwrap_err();
        assert!(matches!(
            err,
            LoginFlowError::Store(StoreError::Timeout(d)) if d == Duration::from_secs(2)
        ));

        let response = ServerError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, serde_json::json!({ "error": "Internal server error" }));
    }
}
