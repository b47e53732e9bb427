mod callback;
mod confirm;
mod initiate;
mod me;
mod poll;

pub use callback::login_callback;
pub use confirm::confirm_login;
pub use initiate::create_session;
pub use me::current_user;
pub use poll::login_status;

use axum::{http::HeaderMap, Json};
use subtle::ConstantTimeEq;

use crate::server::{error::ServerError, models::HealthResponse, AppState};

pub const CALLBACK_SECRET_HEADER: &str = "x-callback-secret";

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Reject messaging-channel calls that do not carry the shared secret.
/// A no-op when no secret is configured.
fn check_callback_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ServerError> {
    let Some(expected) = state.callback_secret.as_deref() else {
        return Ok(());
    };

    let provided = headers
        .get(CALLBACK_SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if provided.len() == expected.len() && bool::from(provided.ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("Callback rejected: bad or missing callback secret");
        Err(ServerError::Unauthorized(
            "Invalid callback secret".to_string(),
        ))
    }
}
