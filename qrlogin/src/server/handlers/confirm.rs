use axum::{extract::State, http::HeaderMap, Json};
use tracing::Instrument;

use super::check_callback_secret;
use crate::server::{
    error::ServerError,
    models::{CallbackResponse, ConfirmRequest},
    AppState,
};

/// `POST /auth/confirm`: the user approved the login on their phone.
pub async fn confirm_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<CallbackResponse>, ServerError> {
    let span = tracing::info_span!("confirm_login", session_id = %req.session_id);
    async move {
        check_callback_secret(&state, &headers)?;

        let session = state.machine.confirm(&req.session_id).await?;

        Ok(Json(CallbackResponse {
            success: true,
            status: session.status,
        }))
    }
    .instrument(span)
    .await
}
