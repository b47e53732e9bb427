use axum::{body::Bytes, extract::State, Json};
use tracing::Instrument;

use crate::common::{CreateSessionRequest, CreateSessionResponse};
use crate::server::{error::ServerError, AppState};

/// `POST /auth/qrcode-session`. The body is optional; an empty one starts a
/// mini program session.
pub async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>, ServerError> {
    let req: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServerError::BadRequest(format!("Invalid request body: {}", e)))?
    };
    let flow = req.flow.unwrap_or_default();

    let span = tracing::info_span!("create_session", flow = %flow.as_str());
    async move {
        let handle = state.machine.create(flow).await?;

        Ok(Json(CreateSessionResponse {
            session_id: handle.session_id,
            expire_time: handle.expire_time,
        }))
    }
    .instrument(span)
    .await
}
