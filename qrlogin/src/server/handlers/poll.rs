use axum::{
    extract::{Query, State},
    Json,
};
use tracing::Instrument;

use crate::common::LoginStatusResponse;
use crate::server::{error::ServerError, models::LoginStatusParams, AppState};

/// `GET /auth/login-status?sessionId=...`, polled by the browser.
pub async fn login_status(
    State(state): State<AppState>,
    Query(params): Query<LoginStatusParams>,
) -> Result<Json<LoginStatusResponse>, ServerError> {
    let span = tracing::info_span!("login_status", session_id = %params.session_id);
    async move {
        let view = state.machine.poll(&params.session_id).await?;

        Ok(Json(LoginStatusResponse {
            status: view.status,
            identity: view.identity,
            token: view.token,
            token_expires_at: view.token_expires_at,
        }))
    }
    .instrument(span)
    .await
}
