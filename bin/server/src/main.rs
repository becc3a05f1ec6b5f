use campus_sso_identity::{ProviderRegistry, SessionIssuer, StateStore};
use campus_sso_server::{
    auth::{self, AppState, OidcProviderClient, provider::http_client},
    config::ServerConfig,
    db::{PgIdentityStore, PgStateStore},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let states = Arc::new(PgStateStore::new(db_pool.clone()));
    match states.purge_expired().await {
        Ok(count) if count > 0 => {
            tracing::info!(
                deleted_states = count,
                "Cleaned up expired authorization states on startup"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Failed to cleanup expired authorization states on startup");
        }
    }

    // Spawn periodic authorization state cleanup task
    let cleanup_states = states.clone();
    let cleanup_interval_secs = config.sso.state_cleanup_interval_seconds;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(cleanup_interval_secs));
        loop {
            interval.tick().await;
            match cleanup_states.purge_expired().await {
                Ok(count) if count > 0 => {
                    tracing::debug!(deleted_states = count, "Periodic authorization state cleanup");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to cleanup expired authorization states");
                }
            }
        }
    });

    // Initialize identity providers
    let http = http_client(std::time::Duration::from_secs(
        config.sso.provider_timeout_seconds,
    ))
    .expect("failed to build provider HTTP client");
    let mut registry = ProviderRegistry::new();
    for (provider, provider_config) in config.providers() {
        tracing::info!(%provider, "Configuring identity provider...");
        let client = OidcProviderClient::from_config(provider, provider_config, http.clone())
            .await
            .expect("failed to configure identity provider");
        registry = registry.register(Arc::new(client));
    }
    if registry.available().is_empty() {
        tracing::warn!("No identity providers configured; SSO routes will return unknown_provider");
    }

    let sessions = Arc::new(SessionIssuer::new(
        config.session.signing_secret.as_bytes(),
        config.session.issuer.clone(),
        chrono::Duration::minutes(config.session.duration_minutes),
    ));

    // Create application state
    let store = Arc::new(PgIdentityStore::new(db_pool));
    let app_state = Arc::new(AppState::new(
        store.clone(),
        store,
        states,
        Arc::new(registry),
        sessions,
        config.sso,
    ));

    let app = auth::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
