use axum::{extract::State, http::HeaderMap, Json};
use tracing::Instrument;

use super::check_callback_secret;
use crate::server::{
    error::ServerError,
    models::{CallbackRequest, CallbackResponse, Identity},
    services::IdentityProvider,
    AppState,
};

/// `POST /auth/callback`, called by the messaging channel once the user has
/// scanned the code.
pub async fn login_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, ServerError> {
    let span = tracing::info_span!("login_callback", session_id = %req.session_id);
    async move {
        check_callback_secret(&state, &headers)?;

        let external_id = state
            .identity
            .exchange(&req.external_code, req.identity.external_id.as_deref())
            .await?;

        let identity = Identity {
            external_id,
            name: req.identity.name,
            avatar: req.identity.avatar,
        };

        let session = state
            .machine
            .report_callback(&req.session_id, identity)
            .await?;

        Ok(Json(CallbackResponse {
            success: true,
            status: session.status,
        }))
    }
    .instrument(span)
    .await
}
