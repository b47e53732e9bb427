use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};

use crate::server::error::ServerError;
use crate::server::services::{Claims, TokenIssuer};

/// Decides whether verified claims may reach the guarded routes
pub type CapabilityCheck = Arc<dyn Fn(&Claims) -> bool + Send + Sync>;

/// State for [`require_auth`]: a token verifier plus an injected capability check.
///
/// ```rust,ignore
/// let admin_only = AuthGuard::new(tokens).with_capability(Arc::new(|c| admins.contains(&c.user_id)));
/// let router = Router::new()
///     .route("/admin/sites", post(create_site))
///     .route_layer(middleware::from_fn_with_state(admin_only, require_auth));
/// ```
#[derive(Clone)]
pub struct AuthGuard {
    tokens: Arc<TokenIssuer>,
    check: CapabilityCheck,
}

impl AuthGuard {
    /// Any holder of a valid token passes
    pub fn new(tokens: Arc<TokenIssuer>) -> Self {
        Self {
            tokens,
            check: Arc::new(|_| true),
        }
    }

    pub fn with_capability(mut self, check: CapabilityCheck) -> Self {
        self.check = check;
        self
    }
}

/// Verified caller, available to handlers behind [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub async fn require_auth(
    State(guard): State<AuthGuard>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| ServerError::Unauthorized("Missing bearer token".to_string()))?;

    let claims = guard.tokens.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        ServerError::Unauthorized(e.to_string())
    })?;

    if !(guard.check)(&claims) {
        tracing::warn!(user_id = %claims.user_id, "Capability check failed");
        return Err(ServerError::Forbidden(
            "Not allowed to access this resource".to_string(),
        ));
    }

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| {
                ServerError::Unauthorized("Route is not behind require_auth".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::models::UserRef;
    use crate::server::services::ManualClock;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    fn issuer() -> Arc<TokenIssuer> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        Arc::new(TokenIssuer::new(
            "middleware-test-secret-0123456789",
            chrono::Duration::days(7),
            clock,
        ))
    }

    fn token_for(tokens: &TokenIssuer, user_id: &str) -> String {
        tokens
            .issue(&UserRef {
                user_id: user_id.to_string(),
                name: "A".to_string(),
                avatar: None,
            })
            .unwrap()
            .value
    }

    async fn whoami(AuthUser(claims): AuthUser) -> String {
        claims.user_id
    }

    fn app(guard: AuthGuard) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .route_layer(middleware::from_fn_with_state(guard, require_auth))
    }

    fn request(token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri("/whoami");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn valid_token_reaches_handler() {
        let tokens = issuer();
        let token = token_for(&tokens, "u-1");

        let response = app(AuthGuard::new(tokens))
            .oneshot(request(Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"u-1");
    }

    #[tokio::test]
    async fn missing_or_bad_token_is_unauthorized() {
        let tokens = issuer();

        let response = app(AuthGuard::new(tokens.clone()))
            .oneshot(request(None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(AuthGuard::new(tokens))
            .oneshot(request(Some("garbage")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn capability_check_is_applied() {
        let tokens = issuer();
        let guard = AuthGuard::new(tokens.clone())
            .with_capability(Arc::new(|claims: &Claims| claims.user_id == "admin"));

        let response = app(guard.clone())
            .oneshot(request(Some(&token_for(&tokens, "u-1"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(guard)
            .oneshot(request(Some(&token_for(&tokens, "admin"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
