//! Federated sign-in over HTTP.
//!
//! This module provides:
//! - The OAuth2/OIDC provider client used in production
//! - Route handlers for starting and completing authorization flows,
//!   refreshing provider tokens, unlinking, and listing providers
//! - The bearer-session extractor for authenticated routes
//!
//! Sessions are stateless HS256 tokens. The browser binding cookie set when a
//! flow starts is the only cookie the server issues; it ties each
//! authorization state to the browser that requested it.

pub mod middleware;
pub mod provider;
pub mod routes;

use axum::{
    Router,
    routing::{delete, get, post},
};
use campus_sso_identity::{
    AccountResolver, CallbackOrchestrator, LinkService, LinkStore, ProviderRegistry,
    RefreshCoordinator, SessionIssuer, StateStore, UserDirectory,
};
use chrono::Duration;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::SsoConfig;

pub use middleware::{AuthRejection, AuthenticatedUser, RequireAuth};
pub use provider::{OidcProviderClient, ProviderEndpoints, ProviderSetupError};

/// Shared application state.
pub struct AppState {
    /// Local accounts.
    pub users: Arc<dyn UserDirectory>,
    /// Drives authorization flows.
    pub orchestrator: CallbackOrchestrator,
    /// Keeps provider tokens fresh.
    pub refresh: RefreshCoordinator,
    /// Unlinking and link overview.
    pub links: LinkService,
    /// Signs and verifies session tokens.
    pub sessions: Arc<SessionIssuer>,
    /// SSO flow configuration.
    pub sso_config: SsoConfig,
}

impl AppState {
    /// Wires the identity services over the given stores and providers.
    pub fn new(
        users: Arc<dyn UserDirectory>,
        links: Arc<dyn LinkStore>,
        states: Arc<dyn StateStore>,
        providers: Arc<ProviderRegistry>,
        sessions: Arc<SessionIssuer>,
        sso_config: SsoConfig,
    ) -> Self {
        let resolver = AccountResolver::new(users.clone(), links.clone())
            .with_policy(sso_config.unverified_email_policy);
        let orchestrator = CallbackOrchestrator::new(
            providers.clone(),
            states,
            resolver,
            sessions.clone(),
            Duration::seconds(sso_config.state_ttl_seconds),
        );
        let refresh = RefreshCoordinator::new(
            links.clone(),
            providers.clone(),
            Duration::seconds(sso_config.refresh_margin_seconds),
        );
        let link_service = LinkService::new(users.clone(), links, providers);

        Self {
            users,
            orchestrator,
            refresh,
            links: link_service,
            sessions,
            sso_config,
        }
    }
}

/// Builds the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/auth/sso/providers", get(routes::providers))
        .route(
            "/auth/sso/{provider}/authorization-url",
            get(routes::authorization_url),
        )
        .route("/auth/sso/{provider}/callback", get(routes::callback))
        .route("/auth/sso/{provider}/refresh", post(routes::refresh))
        .route("/auth/sso/{provider}", delete(routes::unlink))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
