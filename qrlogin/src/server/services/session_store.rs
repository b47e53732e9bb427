use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::clock::Clock;
use super::scene_registry::SceneRegistry;
use super::sqlite_store::SqliteStore;
use crate::common::SessionStatus;
use crate::server::models::LoginSession;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The stored status did not match. Carries the record as it is now,
    /// or `None` if it has been removed.
    Mismatch(Option<LoginSession>),
}

/// Storage capability the login machine needs.
///
/// Every status change goes through [`SessionStore::compare_and_set`], so a
/// backend only has to make that one call atomic.
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a new session, failing with `AlreadyExists` if the id is taken.
    fn insert(&self, session: LoginSession)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<Option<LoginSession>, StoreError>> + Send;

    /// Replace the record with `next` only if its stored status is `expected`.
    fn compare_and_set(
        &self,
        expected: SessionStatus,
        next: LoginSession,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;

    /// Drop every session whose deadline is before `now`. Returns how many.
    fn purge_expired(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

/// Session backend selected by `session.backend`
pub enum SessionBackend {
    Memory(SceneRegistry),
    Sqlite(SqliteStore),
}

impl SessionStore for SessionBackend {
    async fn insert(&self, session: LoginSession) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.insert(session).await,
            Self::Sqlite(store) => store.insert(session).await,
        }
    }

    async fn get(&self, session_id: &str) -> Result<Option<LoginSession>, StoreError> {
        match self {
            Self::Memory(store) => store.get(session_id).await,
            Self::Sqlite(store) => store.get(session_id).await,
        }
    }

    async fn compare_and_set(
        &self,
        expected: SessionStatus,
        next: LoginSession,
    ) -> Result<CasOutcome, StoreError> {
        match self {
            Self::Memory(store) => store.compare_and_set(expected, next).await,
            Self::Sqlite(store) => store.compare_and_set(expected, next).await,
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        match self {
            Self::Memory(store) => store.purge_expired(now).await,
            Self::Sqlite(store) => store.purge_expired(now).await,
        }
    }
}

/// Generate an unguessable session id (32 random bytes, URL-safe)
pub fn generate_session_id() -> String {
    let mut rng = rand::rng();
    let random_bytes: Vec<u8> = (0..32).map(|_| rng.random()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&random_bytes)
}

/// Spawn the background task that reclaims storage held by dead sessions.
///
/// Correctness never depends on this running: every reader re-checks expiry.
pub fn spawn_sweeper<S: SessionStore>(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_expired(clock.now()).await {
                Ok(0) => {}
                Ok(cleaned) => tracing::info!("Cleaned up {} expired sessions", cleaned),
                Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
            }
        }
    })
}
