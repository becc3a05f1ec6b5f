//! Identity provider client configuration.
//!
//! One `ProviderConfig` describes one OAuth2/OIDC client registration.
//! Endpoints may be given explicitly, discovered from the issuer's
//! `.well-known/openid-configuration`, or derived from the Keycloak realm URL.

use serde::Deserialize;
use std::fmt;

/// Configuration for a single identity provider client.
///
/// Fields with defaults can be omitted when loading from environment variables.
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    /// The issuer URL (e.g., "https://sso.campus.example/realms/students").
    issuer_url: String,
    /// The OAuth2 client ID registered with the provider.
    client_id: String,
    /// The OAuth2 client secret.
    client_secret: String,
    /// The redirect URI registered for the callback route.
    redirect_uri: String,
    /// OAuth2 scopes to request as a comma-separated string.
    /// Default: "openid,email,profile"
    #[serde(default = "default_scopes")]
    scopes: String,
    /// Overrides the authorization endpoint.
    #[serde(default)]
    auth_url: Option<String>,
    /// Overrides the token endpoint.
    #[serde(default)]
    token_url: Option<String>,
    /// Overrides the userinfo endpoint.
    #[serde(default)]
    userinfo_url: Option<String>,
    /// Overrides the token revocation endpoint.
    #[serde(default)]
    revocation_url: Option<String>,
    /// Resolve endpoints through OIDC discovery at startup.
    #[serde(default)]
    discover: bool,
}

fn default_scopes() -> String {
    "openid,email,profile".to_string()
}

impl ProviderConfig {
    /// Creates a configuration with defaults for optional fields.
    #[must_use]
    pub fn new(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        ProviderConfigBuilder::new(issuer_url, client_id, client_secret, redirect_uri).build()
    }

    /// Creates a configuration builder for more customization.
    #[must_use]
    pub fn builder(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> ProviderConfigBuilder {
        ProviderConfigBuilder::new(issuer_url, client_id, client_secret, redirect_uri)
    }

    /// Returns the issuer URL without a trailing slash.
    #[must_use]
    pub fn issuer_url(&self) -> &str {
        self.issuer_url.trim_end_matches('/')
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Returns the scopes to request, parsed from the comma-separated string.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        self.scopes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    #[must_use]
    pub fn auth_url(&self) -> Option<&str> {
        self.auth_url.as_deref()
    }

    #[must_use]
    pub fn token_url(&self) -> Option<&str> {
        self.token_url.as_deref()
    }

    #[must_use]
    pub fn userinfo_url(&self) -> Option<&str> {
        self.userinfo_url.as_deref()
    }

    #[must_use]
    pub fn revocation_url(&self) -> Option<&str> {
        self.revocation_url.as_deref()
    }

    /// Returns true if endpoints should come from OIDC discovery.
    #[must_use]
    pub fn discover(&self) -> bool {
        self.discover
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("issuer_url", &self.issuer_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("discover", &self.discover)
            .finish_non_exhaustive()
    }
}

/// Builder for `ProviderConfig`.
#[derive(Debug)]
pub struct ProviderConfigBuilder {
    issuer_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
    auth_url: Option<String>,
    token_url: Option<String>,
    userinfo_url: Option<String>,
    revocation_url: Option<String>,
    discover: bool,
}

impl ProviderConfigBuilder {
    /// Creates a new builder with required fields.
    #[must_use]
    pub fn new(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            issuer_url,
            client_id,
            client_secret,
            redirect_uri,
            scopes: default_scopes().split(',').map(str::to_string).collect(),
            auth_url: None,
            token_url: None,
            userinfo_url: None,
            revocation_url: None,
            discover: false,
        }
    }

    #[must_use]
    pub fn auth_url(mut self, url: String) -> Self {
        self.auth_url = Some(url);
        self
    }

    #[must_use]
    pub fn token_url(mut self, url: String) -> Self {
        self.token_url = Some(url);
        self
    }

    #[must_use]
    pub fn userinfo_url(mut self, url: String) -> Self {
        self.userinfo_url = Some(url);
        self
    }

    #[must_use]
    pub fn revocation_url(mut self, url: String) -> Self {
        self.revocation_url = Some(url);
        self
    }

    #[must_use]
    pub fn discover(mut self, discover: bool) -> Self {
        self.discover = discover;
        self
    }

    #[must_use]
    pub fn build(self) -> ProviderConfig {
        ProviderConfig {
            issuer_url: self.issuer_url,
            client_id: self.client_id,
            client_secret: self.client_secret,
            redirect_uri: self.redirect_uri,
            scopes: self.scopes.join(","),
            auth_url: self.auth_url,
            token_url: self.token_url,
            userinfo_url: self.userinfo_url,
            revocation_url: self.revocation_url,
            discover: self.discover,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProviderConfigBuilder {
        ProviderConfig::builder(
            "https://sso.campus.example/realms/students/".to_string(),
            "portal".to_string(),
            "s3cr3t".to_string(),
            "https://portal.campus.example/auth/sso/keycloak/callback".to_string(),
        )
    }

    #[test]
    fn defaults() {
        let config = sample().build();

        assert_eq!(
            config.issuer_url(),
            "https://sso.campus.example/realms/students"
        );
        assert_eq!(config.scopes(), vec!["openid", "email", "profile"]);
        assert!(config.token_url().is_none());
        assert!(!config.discover());
    }

    #[test]
    fn debug_redacts_client_secret() {
        let rendered = format!("{:?}", sample().build());
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("portal"));
    }

    #[test]
    fn deserializes_with_overrides() {
        let json = r#"{
            "issuer_url": "https://accounts.google.com",
            "client_id": "portal.apps.googleusercontent.com",
            "client_secret": "secret",
            "redirect_uri": "https://portal.campus.example/auth/sso/google/callback",
            "scopes": "openid, email ,profile",
            "token_url": "https://oauth2.googleapis.com/token",
            "discover": true
        }"#;

        let config: ProviderConfig = serde_json::from_str(json).expect("deserialize");

        assert_eq!(config.scopes(), vec!["openid", "email", "profile"]);
        assert_eq!(
            config.token_url(),
            Some("https://oauth2.googleapis.com/token")
        );
        assert!(config.discover());
    }
}
