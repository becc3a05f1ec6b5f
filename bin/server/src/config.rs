//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables
//! (`SESSION__SIGNING_SECRET`, `SSO__STATE_TTL_SECONDS`, `KEYCLOAK__CLIENT_ID`, ...).
//!
//! See [`ProviderConfig`] for identity provider client configuration.

use campus_sso_identity::{Provider, ProviderConfig, UnverifiedEmailPolicy};
use serde::Deserialize;
use std::fmt;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Session token configuration.
    pub session: SessionConfig,

    /// SSO flow configuration.
    #[serde(default)]
    pub sso: SsoConfig,

    /// Keycloak client, if enabled.
    #[serde(default)]
    pub keycloak: Option<ProviderConfig>,

    /// Google client, if enabled.
    #[serde(default)]
    pub google: Option<ProviderConfig>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

/// Session token configuration.
#[derive(Clone, Deserialize)]
pub struct SessionConfig {
    /// HMAC key for session tokens.
    pub signing_secret: String,

    /// Session duration in minutes. Independent of provider token lifetimes.
    #[serde(default = "default_session_duration_minutes")]
    pub duration_minutes: i64,

    /// `iss` claim of issued sessions.
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

fn default_session_duration_minutes() -> i64 {
    480
}

fn default_issuer() -> String {
    "campus-sso".to_string()
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("signing_secret", &"***")
            .field("duration_minutes", &self.duration_minutes)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// SSO flow configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SsoConfig {
    /// Lifetime of a pending authorization state, in seconds.
    #[serde(default = "default_state_ttl_seconds")]
    pub state_ttl_seconds: i64,

    /// Provider tokens expiring within this many seconds are refreshed.
    #[serde(default = "default_refresh_margin_seconds")]
    pub refresh_margin_seconds: i64,

    /// Timeout for every call to an identity provider, in seconds.
    #[serde(default = "default_provider_timeout_seconds")]
    pub provider_timeout_seconds: u64,

    /// What to do with identities whose email the provider has not verified.
    #[serde(default)]
    pub unverified_email_policy: UnverifiedEmailPolicy,

    /// Whether to set the Secure flag on cookies (requires HTTPS).
    /// Defaults to true for production safety; set to false for local HTTP development.
    #[serde(default = "default_secure_cookies")]
    pub secure_cookies: bool,

    /// When set, failed callbacks redirect to `<url>?error=<code>` instead of returning JSON.
    #[serde(default)]
    pub failure_redirect: Option<String>,

    /// Interval between expired-state cleanup runs, in seconds.
    #[serde(default = "default_state_cleanup_interval_seconds")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_state_ttl_seconds() -> i64 {
    600
}

fn default_refresh_margin_seconds() -> i64 {
    60
}

fn default_provider_timeout_seconds() -> u64 {
    10
}

fn default_secure_cookies() -> bool {
    true
}

fn default_state_cleanup_interval_seconds() -> u64 {
    300
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl_seconds(),
            refresh_margin_seconds: default_refresh_margin_seconds(),
            provider_timeout_seconds: default_provider_timeout_seconds(),
            unverified_email_policy: UnverifiedEmailPolicy::default(),
            secure_cookies: default_secure_cookies(),
            failure_redirect: None,
            state_cleanup_interval_seconds: default_state_cleanup_interval_seconds(),
        }
    }
}

impl SsoConfig {
    /// Rejects values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the offending setting.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.state_cleanup_interval_seconds == 0 {
            return Err(config::ConfigError::Message(
                "sso.state_cleanup_interval_seconds must be greater than zero".to_string(),
            ));
        }
        if self.provider_timeout_seconds == 0 {
            return Err(config::ConfigError::Message(
                "sso.provider_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.state_ttl_seconds <= 0 {
            return Err(config::ConfigError::Message(
                "sso.state_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.sso.validate()?;
        Ok(config)
    }

    /// Configured providers, in a stable order.
    #[must_use]
    pub fn providers(&self) -> Vec<(Provider, &ProviderConfig)> {
        [
            (Provider::Keycloak, self.keycloak.as_ref()),
            (Provider::Google, self.google.as_ref()),
        ]
        .into_iter()
        .filter_map(|(provider, config)| config.map(|c| (provider, c)))
        .collect()
    }
}
