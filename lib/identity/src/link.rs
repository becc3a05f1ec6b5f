//! SSO links and the provider tokens they carry.
//!
//! An `SsoLink` binds one local user to one `(provider, provider_id)` pair.
//! Token values are wrapped in `Secret`, which redacts `Debug` and does not
//! implement `Serialize`, so they cannot leak into logs or response bodies.

use campus_sso_core::{SsoLinkId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SsoError;
use crate::provider::TokenGrant;

/// Supported identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Keycloak realm (the campus IdP).
    Keycloak,
    /// Google Workspace accounts.
    Google,
}

impl Provider {
    /// Every provider this build knows about.
    pub const ALL: [Provider; 2] = [Provider::Keycloak, Provider::Google];

    /// Returns the lowercase name used in URLs and storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keycloak => "keycloak",
            Self::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = SsoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SsoError::UnknownProvider {
                name: s.to_string(),
            })
    }
}

/// A token value that must never be logged or serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw value. Only provider clients and stores should call this.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Provider tokens as stored on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    access_token: Secret,
    refresh_token: Option<Secret>,
    expires_at: DateTime<Utc>,
}

impl TokenSet {
    #[must_use]
    pub fn new(
        access_token: Secret,
        refresh_token: Option<Secret>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
        }
    }

    /// Builds a token set from a provider grant received at `issued_at`.
    ///
    /// Providers that do not rotate refresh tokens omit them from refresh
    /// responses; `previous_refresh` is kept in that case.
    #[must_use]
    pub fn from_grant(
        grant: TokenGrant,
        issued_at: DateTime<Utc>,
        previous_refresh: Option<Secret>,
    ) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            expires_at: issued_at + grant.expires_in,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &Secret {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&Secret> {
        self.refresh_token.as_ref()
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true if the access token expires before `now + margin`.
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at <= now + margin
    }
}

/// A binding between a local user and an external identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoLink {
    id: SsoLinkId,
    user_id: UserId,
    provider: Provider,
    provider_id: String,
    tokens: TokenSet,
    reauth_required: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SsoLink {
    /// Creates a new link with a generated ID.
    #[must_use]
    pub fn new(user_id: UserId, provider: Provider, provider_id: String, tokens: TokenSet) -> Self {
        let now = Utc::now();
        Self {
            id: SsoLinkId::new(),
            user_id,
            provider,
            provider_id,
            tokens,
            reauth_required: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a link with all fields specified, for reconstitution from storage.
    #[must_use]
    #[expect(clippy::too_many_arguments)]
    pub fn with_all_fields(
        id: SsoLinkId,
        user_id: UserId,
        provider: Provider,
        provider_id: String,
        tokens: TokenSet,
        reauth_required: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            provider,
            provider_id,
            tokens,
            reauth_required,
            created_at,
            updated_at,
        }
    }

    #[must_use]
    pub fn id(&self) -> SsoLinkId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Returns the IdP's opaque subject identifier.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    /// Returns true once the IdP has rejected the stored refresh token.
    #[must_use]
    pub fn reauth_required(&self) -> bool {
        self.reauth_required
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Overwrites the tokens in place and clears the re-authorization flag.
    pub fn set_tokens(&mut self, tokens: TokenSet) {
        self.tokens = tokens;
        self.reauth_required = false;
        self.updated_at = Utc::now();
    }

    /// Flags the link as needing a fresh authorization flow.
    pub fn mark_reauth_required(&mut self) {
        self.reauth_required = true;
        self.updated_at = Utc::now();
    }

    /// Returns the token-free projection safe to hand to API callers.
    #[must_use]
    pub fn summary(&self) -> LinkSummary {
        LinkSummary {
            provider: self.provider,
            linked_at: self.created_at,
            expires_at: self.tokens.expires_at,
            reauth_required: self.reauth_required,
        }
    }
}

/// Public view of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSummary {
    pub provider: Provider,
    pub linked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reauth_required: bool,
}
