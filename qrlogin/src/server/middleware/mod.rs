mod auth;

pub use auth::{require_auth, AuthGuard, AuthUser, CapabilityCheck};
