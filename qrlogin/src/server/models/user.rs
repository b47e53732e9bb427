use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::PublicIdentity;

/// Local account bound to one external identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub external_id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
}

/// The subset of a user a token is minted for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
}

impl From<&UserRecord> for UserRef {
    fn from(user: &UserRecord) -> Self {
        Self {
            user_id: user.id.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
        }
    }
}

impl From<UserRef> for PublicIdentity {
    fn from(user: UserRef) -> Self {
        Self {
            user_id: user.user_id,
            name: user.name,
            avatar: user.avatar,
        }
    }
}
