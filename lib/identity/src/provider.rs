//! Identity provider abstraction.
//!
//! `IdentityProvider` is the seam between the callback flow and a concrete
//! OAuth2/OIDC client. The server wires in HTTP-backed clients; tests use
//! [`MemoryProvider`](crate::memory::MemoryProvider).

use async_trait::async_trait;
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ProviderError, SsoError};
use crate::link::{Provider, Secret};

/// Lifetime assumed when the token endpoint omits `expires_in`, in seconds.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 300;

/// Tokens returned by a code exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: Secret,
    /// `None` when the provider did not issue (or rotate) a refresh token.
    pub refresh_token: Option<Secret>,
    pub expires_in: Duration,
}

impl TokenGrant {
    /// Builds a grant, falling back to the default lifetime when the provider
    /// did not report one.
    #[must_use]
    pub fn new(
        access_token: Secret,
        refresh_token: Option<Secret>,
        expires_in: Option<Duration>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_in: expires_in
                .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS)),
        }
    }
}

/// Profile claims asserted by the provider's userinfo endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalIdentity {
    /// The provider's stable subject identifier (`sub`).
    pub subject: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

/// Operations the SSO flow needs from an identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Which provider this client talks to.
    fn provider(&self) -> Provider;

    /// Builds the URL to redirect the browser to.
    ///
    /// The PKCE challenge is derived from `pkce_verifier` with S256.
    fn authorization_url(&self, state: &str, pkce_verifier: &str) -> String;

    /// Exchanges an authorization code at the token endpoint.
    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<TokenGrant, ProviderError>;

    /// Fetches the user's profile with a freshly issued access token.
    async fn fetch_identity(&self, access_token: &Secret)
    -> Result<ExternalIdentity, ProviderError>;

    /// Redeems a refresh token for a new grant.
    async fn refresh(&self, refresh_token: &Secret) -> Result<TokenGrant, ProviderError>;

    /// Revokes a token at the provider. Providers without a revocation
    /// endpoint return `Ok(())`.
    async fn revoke(&self, token: &Secret) -> Result<(), ProviderError>;
}

/// The set of configured providers, keyed by [`Provider`].
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    clients: BTreeMap<Provider, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client under the provider it reports. A later
    /// registration for the same provider replaces the earlier one.
    #[must_use]
    pub fn register(mut self, client: Arc<dyn IdentityProvider>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    /// Looks up the client for `provider`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` if the provider is not configured.
    pub fn get(&self, provider: Provider) -> Result<Arc<dyn IdentityProvider>, SsoError> {
        self.clients
            .get(&provider)
            .cloned()
            .ok_or_else(|| SsoError::UnknownProvider {
                name: provider.to_string(),
            })
    }

    /// Returns the configured providers in a stable order.
    #[must_use]
    pub fn available(&self) -> Vec<Provider> {
        self.clients.keys().copied().collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available())
            .finish()
    }
}
