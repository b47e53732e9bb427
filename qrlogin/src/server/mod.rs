pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

pub use config::Configuration;
pub use error::ServerError;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use config::{ServerConfiguration, StoreBackendKind};
use middleware::{require_auth, AuthGuard};
use services::{
    Clock, IdentityBackend, LoginSessionMachine, MachineSettings, MemoryUserStore, SceneRegistry,
    SessionBackend, SqliteStore, TokenIssuer, UserBackend,
};

pub type Machine = LoginSessionMachine<SessionBackend, UserBackend>;

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<Machine>,
    pub identity: Arc<IdentityBackend>,
    /// Required in `X-Callback-Secret` on callback and confirm when set
    pub callback_secret: Option<Arc<str>>,
}

impl AppState {
    /// Wire up stores, token issuer and identity provider from configuration
    pub fn from_configuration(
        configuration: &Configuration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServerError> {
        configuration.validate()?;
        let session = &configuration.session;

        let (sessions, users) = match session.backend {
            StoreBackendKind::Memory => (
                SessionBackend::Memory(SceneRegistry::new()),
                UserBackend::Memory(MemoryUserStore::new()),
            ),
            StoreBackendKind::Sqlite => {
                // One connection serves both tables
                let store = SqliteStore::open(&session.sqlite_path)?;
                (
                    SessionBackend::Sqlite(store.clone()),
                    UserBackend::Sqlite(store),
                )
            }
        };

        let tokens = TokenIssuer::new(
            &configuration.token.secret,
            chrono::Duration::days(configuration.token.ttl_days),
            clock.clone(),
        );

        let settings = MachineSettings {
            session_ttl: chrono::Duration::seconds(session.ttl_seconds as i64),
            store_timeout: Duration::from_millis(session.store_timeout_ms),
        };

        let machine = LoginSessionMachine::new(
            Arc::new(sessions),
            Arc::new(users),
            Arc::new(tokens),
            clock,
            settings,
        );

        let identity = IdentityBackend::from_config(configuration.wechat.as_ref())?;

        Ok(Self {
            machine: Arc::new(machine),
            identity: Arc::new(identity),
            callback_secret: session.callback_secret.as_deref().map(Arc::from),
        })
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Build the HTTP surface. `/auth/me` sits behind the bearer-token guard.
pub fn router(state: AppState, server: &ServerConfiguration) -> Router {
    let guard = AuthGuard::new(state.machine.tokens().clone());

    let protected = Router::new()
        .route("/auth/me", get(handlers::current_user))
        .route_layer(axum::middleware::from_fn_with_state(guard, require_auth));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/auth/qrcode-session", post(handlers::create_session))
        .route("/auth/login-status", get(handlers::login_status))
        .route("/auth/callback", post(handlers::login_callback))
        .route("/auth/confirm", post(handlers::confirm_login))
        .merge(protected)
        .layer(
            // The limit layer's response body has no `Default`, which the
            // timeout and CORS layers need, so it stays outermost.
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&server.allowed_origins))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(server.request_timeout_secs),
                )),
        )
        .with_state(state)
}
