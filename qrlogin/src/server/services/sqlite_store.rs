use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::session_store::{CasOutcome, SessionStore, StoreError};
use super::user_store::UserStore;
use crate::common::SessionStatus;
use crate::server::models::{Identity, LoginSession, UserRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Durable backend for sessions and users.
///
/// rusqlite is blocking, so every call runs on the blocking pool behind a
/// mutex. Conditional updates are single `UPDATE … WHERE status = ?`
/// statements, which keeps them atomic even with other writers on the file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(format!("sqlite: {}", err))
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "Opened sqlite session store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS login_sessions (
                session_id TEXT PRIMARY KEY,
                flow TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expire_time INTEGER NOT NULL,
                identity TEXT,
                resolved_user_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_login_sessions_expire_time
                ON login_sessions (expire_time);

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                avatar TEXT,
                created_at INTEGER NOT NULL,
                last_login_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the blocking pool. A caller that stops waiting (the store
    /// timeout) does not cancel `f`: a compare-and-set may still land after
    /// the request failed. Each write stays atomic and the next poll sees it.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {}", e)))?
    }
}

struct SessionRow {
    session_id: String,
    flow: String,
    status: String,
    created_at: i64,
    expire_time: i64,
    identity: Option<String>,
    resolved_user_id: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            flow: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            expire_time: row.get(4)?,
            identity: row.get(5)?,
            resolved_user_id: row.get(6)?,
        })
    }

    fn into_session(self) -> Result<LoginSession, StoreError> {
        let identity = self
            .identity
            .map(|raw| serde_json::from_str::<Identity>(&raw))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("corrupt identity column: {}", e)))?;

        Ok(LoginSession {
            flow: self.flow.parse().map_err(StoreError::Backend)?,
            status: self.status.parse().map_err(StoreError::Backend)?,
            created_at: from_millis(self.created_at)?,
            expire_time: from_millis(self.expire_time)?,
            session_id: self.session_id,
            identity,
            resolved_user_id: self.resolved_user_id,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("timestamp out of range: {}", ms)))
}

fn identity_json(identity: Option<&Identity>) -> Result<Option<String>, StoreError> {
    identity
        .map(|i| serde_json::to_string(i))
        .transpose()
        .map_err(|e| StoreError::Backend(format!("cannot encode identity: {}", e)))
}

fn select_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<LoginSession>, StoreError> {
    conn.query_row(
        "SELECT session_id, flow, status, created_at, expire_time, identity, resolved_user_id
         FROM login_sessions WHERE session_id = ?1",
        params![session_id],
        SessionRow::from_row,
    )
    .optional()?
    .map(SessionRow::into_session)
    .transpose()
}

struct UserRow {
    id: String,
    external_id: String,
    name: String,
    avatar: Option<String>,
    created_at: i64,
    last_login_at: i64,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            external_id: row.get(1)?,
            name: row.get(2)?,
            avatar: row.get(3)?,
            created_at: row.get(4)?,
            last_login_at: row.get(5)?,
        })
    }

    fn into_user(self) -> Result<UserRecord, StoreError> {
        Ok(UserRecord {
            created_at: from_millis(self.created_at)?,
            last_login_at: from_millis(self.last_login_at)?,
            id: self.id,
            external_id: self.external_id,
            name: self.name,
            avatar: self.avatar,
        })
    }
}

// `column` is always one of our own literals, never user input.
fn select_user(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<UserRecord>, StoreError> {
    let sql = format!(
        "SELECT id, external_id, name, avatar, created_at, last_login_at FROM users WHERE {} = ?1",
        column
    );
    conn.query_row(&sql, params![value], UserRow::from_row)
        .optional()?
        .map(UserRow::into_user)
        .transpose()
}

impl SessionStore for SqliteStore {
    async fn insert(&self, session: LoginSession) -> Result<(), StoreError> {
        let identity = identity_json(session.identity.as_ref())?;
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO login_sessions
                 (session_id, flow, status, created_at, expire_time, identity, resolved_user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.session_id,
                    session.flow.as_str(),
                    session.status.as_str(),
                    session.created_at.timestamp_millis(),
                    session.expire_time.timestamp_millis(),
                    identity,
                    session.resolved_user_id,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AlreadyExists(session.session_id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, session_id: &str) -> Result<Option<LoginSession>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| select_session(conn, &session_id))
            .await
    }

    async fn compare_and_set(
        &self,
        expected: SessionStatus,
        next: LoginSession,
    ) -> Result<CasOutcome, StoreError> {
        let identity = identity_json(next.identity.as_ref())?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE login_sessions
                 SET status = ?1, identity = ?2, resolved_user_id = ?3, expire_time = ?4
                 WHERE session_id = ?5 AND status = ?6",
                params![
                    next.status.as_str(),
                    identity,
                    next.resolved_user_id,
                    next.expire_time.timestamp_millis(),
                    next.session_id,
                    expected.as_str(),
                ],
            )?;

            if changed == 1 {
                Ok(CasOutcome::Applied)
            } else {
                Ok(CasOutcome::Mismatch(select_session(conn, &next.session_id)?))
            }
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM login_sessions WHERE expire_time < ?1",
                params![now.timestamp_millis()],
            )?)
        })
        .await
    }
}

impl UserStore for SqliteStore {
    async fn find_or_create(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StoreError> {
        let identity = identity.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, external_id, name, avatar, created_at, last_login_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(external_id) DO UPDATE SET
                    name = excluded.name,
                    avatar = excluded.avatar,
                    last_login_at = excluded.last_login_at",
                params![
                    Uuid::new_v4().to_string(),
                    identity.external_id,
                    identity.name,
                    identity.avatar,
                    now.timestamp_millis(),
                ],
            )?;

            select_user(conn, "external_id", &identity.external_id)?.ok_or_else(|| {
                StoreError::Backend(format!(
                    "user for {} vanished after upsert",
                    identity.external_id
                ))
            })
        })
        .await
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| select_user(conn, "id", &user_id))
            .await
    }
}
