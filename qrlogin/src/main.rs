use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use qrlogin::server::{
    config::Configuration,
    router,
    services::{spawn_sweeper, Clock, SystemClock},
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .init();

    let configuration = Configuration::new()?;
    tracing::info!(
        backend = ?configuration.session.backend,
        ttl_seconds = configuration.session.ttl_seconds,
        "Configuration loaded successfully"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let app_state = AppState::from_configuration(&configuration, clock.clone())?;

    let _sweeper = spawn_sweeper(
        app_state.machine.store().clone(),
        clock,
        Duration::from_secs(configuration.session.sweep_interval_secs),
    );

    let app = router(app_state, &configuration.server);

    let addr = format!(
        "{}:{}",
        configuration.server.host, configuration.server.port
    );
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
