use std::future::Future;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::session_store::StoreError;
use super::sqlite_store::SqliteStore;
use crate::server::models::{Identity, UserRecord};

/// Local user accounts, unique on the external identity.
pub trait UserStore: Send + Sync + 'static {
    /// Find the user bound to `identity.external_id`, creating it if needed.
    /// Name and avatar are refreshed on every call.
    fn find_or_create(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<UserRecord, StoreError>> + Send;

    fn find_by_id(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<UserRecord>, StoreError>> + Send;
}

/// In-memory users keyed by external id
#[derive(Default)]
pub struct MemoryUserStore {
    users: DashMap<String, UserRecord>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for MemoryUserStore {
    async fn find_or_create(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StoreError> {
        let user = self
            .users
            .entry(identity.external_id.clone())
            .and_modify(|user| {
                user.name = identity.name.clone();
                user.avatar = identity.avatar.clone();
                user.last_login_at = now;
            })
            .or_insert_with(|| {
                let user = UserRecord {
                    id: Uuid::new_v4().to_string(),
                    external_id: identity.external_id.clone(),
                    name: identity.name.clone(),
                    avatar: identity.avatar.clone(),
                    created_at: now,
                    last_login_at: now,
                };
                tracing::info!(user_id = %user.id, "Created user for new external identity");
                user
            })
            .clone();

        Ok(user)
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.id == user_id)
            .map(|entry| entry.clone()))
    }
}

/// User backend selected alongside the session backend
pub enum UserBackend {
    Memory(MemoryUserStore),
    Sqlite(SqliteStore),
}

impl UserStore for UserBackend {
    async fn find_or_create(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StoreError> {
        match self {
            Self::Memory(store) => store.find_or_create(identity, now).await,
            Self::Sqlite(store) => store.find_or_create(identity, now).await,
        }
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        match self {
            Self::Memory(store) => store.find_by_id(user_id).await,
            Self::Sqlite(store) => store.find_by_id(user_id).await,
        }
    }
}
