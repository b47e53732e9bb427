use axum::{extract::State, Json};
use chrono::DateTime;

use crate::server::{
    error::ServerError, middleware::AuthUser, models::UserProfileResponse, AppState,
};

/// `GET /auth/me`: the stored account behind the bearer token.
pub async fn current_user(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<UserProfileResponse>, ServerError> {
    let user = state.machine.user(&claims.user_id).await?;

    Ok(Json(UserProfileResponse {
        user_id: user.id,
        name: user.name,
        avatar: user.avatar,
        created_at: user.created_at,
        last_login_at: user.last_login_at,
        token_expires_at: DateTime::from_timestamp(claims.exp, 0),
    }))
}
