//! HTTP identity provider client built on the `oauth2` crate.
//!
//! The token, refresh and revocation calls go through an oauth2 `BasicClient`;
//! userinfo is a plain reqwest call. Every request shares one `reqwest::Client`
//! with a bounded timeout and redirects disabled.

use async_trait::async_trait;
use campus_sso_identity::{
    ExternalIdentity, IdentityProvider, Provider, ProviderConfig, ProviderError, Secret,
    TokenGrant,
};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, ConfigurationError, CsrfToken,
    EndpointMaybeSet, EndpointNotSet, EndpointSet, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, RefreshToken, RequestTokenError, RevocationUrl, Scope, StandardRevocableToken,
    TokenResponse, TokenUrl,
};
use openidconnect::IssuerUrl;
use openidconnect::core::CoreProviderMetadata;
use rootcause::prelude::Report;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

/// Google's fixed OAuth endpoints.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const GOOGLE_REVOCATION_URL: &str = "https://oauth2.googleapis.com/revoke";

/// Auth, token and redirect set; revocation optional.
type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointMaybeSet, EndpointSet>;

/// Errors building a provider client at startup.
#[derive(Debug)]
pub enum ProviderSetupError {
    /// A configured URL does not parse.
    InvalidUrl { field: &'static str, reason: String },
    /// OIDC discovery failed.
    Discovery { reason: String },
    /// Discovery did not advertise a required endpoint.
    MissingEndpoint { endpoint: &'static str },
    /// The HTTP client could not be built.
    HttpClient { reason: String },
}

impl fmt::Display for ProviderSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { field, reason } => write!(f, "invalid {field}: {reason}"),
            Self::Discovery { reason } => write!(f, "provider discovery failed: {reason}"),
            Self::MissingEndpoint { endpoint } => {
                write!(f, "provider metadata has no {endpoint} endpoint")
            }
            Self::HttpClient { reason } => write!(f, "failed to create HTTP client: {reason}"),
        }
    }
}

impl std::error::Error for ProviderSetupError {}

/// Builds the shared HTTP client for provider calls.
///
/// # Errors
///
/// Returns `HttpClient` if the TLS backend cannot be initialized.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, Report<ProviderSetupError>> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderSetupError::HttpClient {
            reason: e.to_string(),
        })?;
    Ok(client)
}

/// Endpoint URLs of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub revocation_url: Option<String>,
}

impl ProviderEndpoints {
    /// Keycloak's fixed layout under a realm issuer URL.
    #[must_use]
    pub fn keycloak_realm(issuer_url: &str) -> Self {
        let base = format!(
            "{}/protocol/openid-connect",
            issuer_url.trim_end_matches('/')
        );
        Self {
            auth_url: format!("{base}/auth"),
            token_url: format!("{base}/token"),
            userinfo_url: format!("{base}/userinfo"),
            revocation_url: Some(format!("{base}/revoke")),
        }
    }

    #[must_use]
    pub fn google() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
            revocation_url: Some(GOOGLE_REVOCATION_URL.to_string()),
        }
    }

    /// Reads endpoints from the issuer's OIDC discovery document.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or the document lacks a token or
    /// userinfo endpoint.
    pub async fn discover(
        issuer_url: &str,
        http: &reqwest::Client,
    ) -> Result<Self, Report<ProviderSetupError>> {
        let issuer = IssuerUrl::new(issuer_url.to_string()).map_err(|e| {
            ProviderSetupError::InvalidUrl {
                field: "issuer_url",
                reason: e.to_string(),
            }
        })?;
        let metadata = CoreProviderMetadata::discover_async(issuer, http)
            .await
            .map_err(|e| ProviderSetupError::Discovery {
                reason: e.to_string(),
            })?;

        let token_url = metadata
            .token_endpoint()
            .ok_or(ProviderSetupError::MissingEndpoint { endpoint: "token" })?
            .url()
            .to_string();
        let userinfo_url = metadata
            .userinfo_endpoint()
            .ok_or(ProviderSetupError::MissingEndpoint {
                endpoint: "userinfo",
            })?
            .url()
            .to_string();

        Ok(Self {
            auth_url: metadata.authorization_endpoint().url().to_string(),
            token_url,
            userinfo_url,
            revocation_url: None,
        })
    }

    /// Picks the base endpoints for `provider` and applies explicit overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery is enabled and fails.
    pub async fn resolve(
        provider: Provider,
        config: &ProviderConfig,
        http: &reqwest::Client,
    ) -> Result<Self, Report<ProviderSetupError>> {
        let base = if config.discover() {
            Self::discover(config.issuer_url(), http).await?
        } else {
            match provider {
                Provider::Keycloak => Self::keycloak_realm(config.issuer_url()),
                Provider::Google => Self::google(),
            }
        };
        Ok(base.with_overrides(config))
    }

    fn with_overrides(mut self, config: &ProviderConfig) -> Self {
        if let Some(url) = config.auth_url() {
            self.auth_url = url.to_string();
        }
        if let Some(url) = config.token_url() {
            self.token_url = url.to_string();
        }
        if let Some(url) = config.userinfo_url() {
            self.userinfo_url = url.to_string();
        }
        if let Some(url) = config.revocation_url() {
            self.revocation_url = Some(url.to_string());
        }
        self
    }
}

/// Maps an oauth2 token endpoint failure onto the provider error taxonomy.
fn classify_token_error<RE: std::error::Error + 'static>(
    err: RequestTokenError<RE, BasicErrorResponse>,
) -> ProviderError {
    match err {
        RequestTokenError::ServerResponse(response) => match response.error() {
            BasicErrorResponseType::InvalidGrant => ProviderError::InvalidGrant {
                reason: response
                    .error_description()
                    .cloned()
                    .unwrap_or_else(|| "invalid_grant".to_string()),
            },
            _ => ProviderError::Protocol {
                reason: response.to_string(),
            },
        },
        RequestTokenError::Request(e) => ProviderError::Unavailable {
            reason: e.to_string(),
        },
        RequestTokenError::Parse(e, _) => ProviderError::Protocol {
            reason: e.to_string(),
        },
        RequestTokenError::Other(reason) => ProviderError::Unavailable { reason },
    }
}

fn grant_from(response: &BasicTokenResponse) -> TokenGrant {
    TokenGrant::new(
        Secret::new(response.access_token().secret().clone()),
        response
            .refresh_token()
            .map(|t| Secret::new(t.secret().clone())),
        response
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok()),
    )
}

/// `email_verified` arrives as a JSON bool from most IdPs and as a string from some.
fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(value)) => value,
        Some(Flag::Text(value)) => value.eq_ignore_ascii_case("true"),
        None => false,
    })
}

/// The userinfo claims we read.
#[derive(Debug, Deserialize)]
struct UserInfoClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    email_verified: bool,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

impl From<UserInfoClaims> for ExternalIdentity {
    fn from(claims: UserInfoClaims) -> Self {
        Self {
            subject: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified,
            given_name: claims.given_name,
            family_name: claims.family_name,
            picture: claims.picture,
        }
    }
}

/// An OAuth2/OIDC client for one configured provider.
pub struct OidcProviderClient {
    provider: Provider,
    client: ConfiguredClient,
    http: reqwest::Client,
    userinfo_url: String,
    scopes: Vec<String>,
}

impl OidcProviderClient {
    /// Creates a client from configuration and resolved endpoints.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` if any endpoint or the redirect URI does not parse.
    pub fn new(
        provider: Provider,
        config: &ProviderConfig,
        endpoints: ProviderEndpoints,
        http: reqwest::Client,
    ) -> Result<Self, Report<ProviderSetupError>> {
        fn invalid(field: &'static str) -> impl FnOnce(oauth2::url::ParseError) -> ProviderSetupError {
            move |e| ProviderSetupError::InvalidUrl {
                field,
                reason: e.to_string(),
            }
        }

        let auth_url = AuthUrl::new(endpoints.auth_url).map_err(invalid("auth_url"))?;
        let token_url = TokenUrl::new(endpoints.token_url).map_err(invalid("token_url"))?;
        let redirect_url =
            RedirectUrl::new(config.redirect_uri().to_string()).map_err(invalid("redirect_uri"))?;
        let revocation_url = endpoints
            .revocation_url
            .map(RevocationUrl::new)
            .transpose()
            .map_err(invalid("revocation_url"))?;

        let client = BasicClient::new(ClientId::new(config.client_id().to_string()))
            .set_client_secret(ClientSecret::new(config.client_secret().to_string()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_revocation_url_option(revocation_url)
            .set_redirect_uri(redirect_url);

        Ok(Self {
            provider,
            client,
            http,
            userinfo_url: endpoints.userinfo_url,
            scopes: config.scopes().into_iter().map(str::to_string).collect(),
        })
    }

    /// Resolves endpoints (discovering them if configured) and builds the client.
    ///
    /// # Errors
    ///
    /// Returns an error if endpoint resolution or client construction fails.
    pub async fn from_config(
        provider: Provider,
        config: &ProviderConfig,
        http: reqwest::Client,
    ) -> Result<Self, Report<ProviderSetupError>> {
        let endpoints = ProviderEndpoints::resolve(provider, config, &http).await?;
        debug!(%provider, ?endpoints, "resolved provider endpoints");
        Self::new(provider, config, endpoints, http)
    }
}

#[async_trait]
impl IdentityProvider for OidcProviderClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn authorization_url(&self, state: &str, pkce_verifier: &str) -> String {
        let verifier = PkceCodeVerifier::new(pkce_verifier.to_string());
        let mut request = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_string()))
            .set_pkce_challenge(PkceCodeChallenge::from_code_verifier_sha256(&verifier));

        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if self.provider == Provider::Google {
            // Google only issues refresh tokens for offline access.
            request = request.add_extra_param("access_type", "offline");
        }

        let (url, _) = request.url();
        url.to_string()
    }

    #[instrument(skip_all, fields(provider = %self.provider))]
    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(&self.http)
            .await
            .map_err(classify_token_error)?;
        Ok(grant_from(&response))
    }

    #[instrument(skip_all, fields(provider = %self.provider))]
    async fn fetch_identity(
        &self,
        access_token: &Secret,
    ) -> Result<ExternalIdentity, ProviderError> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token.expose())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Unauthorized {
                reason: format!("userinfo returned {status}"),
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable {
                reason: format!("userinfo returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Protocol {
                reason: format!("userinfo returned {status}"),
            });
        }

        let claims: UserInfoClaims =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Protocol {
                    reason: format!("userinfo body: {e}"),
                })?;
        Ok(claims.into())
    }

    #[instrument(skip_all, fields(provider = %self.provider))]
    async fn refresh(&self, refresh_token: &Secret) -> Result<TokenGrant, ProviderError> {
        let token = RefreshToken::new(refresh_token.expose().to_string());
        let response = self
            .client
            .exchange_refresh_token(&token)
            .request_async(&self.http)
            .await
            .map_err(classify_token_error)?;
        Ok(grant_from(&response))
    }

    #[instrument(skip_all, fields(provider = %self.provider))]
    async fn revoke(&self, token: &Secret) -> Result<(), ProviderError> {
        let revocable =
            StandardRevocableToken::RefreshToken(RefreshToken::new(token.expose().to_string()));
        let request = match self.client.revoke_token(revocable) {
            Ok(request) => request,
            Err(ConfigurationError::MissingUrl(_)) => {
                debug!("no revocation endpoint configured");
                return Ok(());
            }
            Err(e) => {
                return Err(ProviderError::Protocol {
                    reason: e.to_string(),
                });
            }
        };

        request
            .request_async(&self.http)
            .await
            .map_err(|e| ProviderError::Unavailable {
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_sso_identity::state::code_challenge;

    fn config() -> ProviderConfig {
        ProviderConfig::new(
            "https://sso.campus.example/realms/students/".to_string(),
            "portal".to_string(),
            "secret".to_string(),
            "https://portal.campus.example/auth/sso/keycloak/callback".to_string(),
        )
    }

    fn client() -> OidcProviderClient {
        let config = config();
        OidcProviderClient::new(
            Provider::Keycloak,
            &config,
            ProviderEndpoints::keycloak_realm(config.issuer_url()),
            reqwest::Client::new(),
        )
        .expect("client")
    }

    #[test]
    fn keycloak_endpoints_follow_realm_layout() {
        let endpoints = ProviderEndpoints::keycloak_realm("https://sso.campus.example/realms/students/");
        assert_eq!(
            endpoints.token_url,
            "https://sso.campus.example/realms/students/protocol/openid-connect/token"
        );
        assert_eq!(
            endpoints.revocation_url.as_deref(),
            Some("https://sso.campus.example/realms/students/protocol/openid-connect/revoke")
        );
    }

    #[test]
    fn explicit_endpoints_override_convention() {
        let config = ProviderConfig::builder(
            "https://sso.campus.example/realms/students".to_string(),
            "portal".to_string(),
            "secret".to_string(),
            "https://portal.campus.example/cb".to_string(),
        )
        .userinfo_url("https://userinfo.campus.example/me".to_string())
        .build();

        let endpoints = ProviderEndpoints::keycloak_realm(config.issuer_url()).with_overrides(&config);
        assert_eq!(endpoints.userinfo_url, "https://userinfo.campus.example/me");
        assert!(endpoints.auth_url.ends_with("/protocol/openid-connect/auth"));
    }

    #[test]
    fn authorization_url_carries_state_and_s256_challenge() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let url = client().authorization_url("state-123", verifier);

        assert!(url.starts_with(
            "https://sso.campus.example/realms/students/protocol/openid-connect/auth?"
        ));
        assert!(url.contains("state=state-123"));
        assert!(url.contains(&format!("code_challenge={}", code_challenge(verifier))));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("scope=openid+email+profile"));
        assert!(url.contains("client_id=portal"));
    }

    #[test]
    fn invalid_grant_is_classified() {
        let err = RequestTokenError::<std::io::Error, BasicErrorResponse>::ServerResponse(
            BasicErrorResponse::new(
                BasicErrorResponseType::InvalidGrant,
                Some("Code not valid".to_string()),
                None,
            ),
        );
        assert_eq!(
            classify_token_error(err),
            ProviderError::InvalidGrant {
                reason: "Code not valid".to_string()
            }
        );
    }

    #[test]
    fn transport_failure_is_unavailable() {
        let err = RequestTokenError::<std::io::Error, BasicErrorResponse>::Request(
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        );
        assert!(matches!(
            classify_token_error(err),
            ProviderError::Unavailable { .. }
        ));
    }

    #[test]
    fn client_errors_are_protocol_errors() {
        let err = RequestTokenError::<std::io::Error, BasicErrorResponse>::ServerResponse(
            BasicErrorResponse::new(BasicErrorResponseType::InvalidClient, None, None),
        );
        assert!(matches!(
            classify_token_error(err),
            ProviderError::Protocol { .. }
        ));
    }

    #[test]
    fn userinfo_accepts_string_email_verified() {
        let claims: UserInfoClaims = serde_json::from_str(
            r#"{"sub":"kc-1","email":"ada@campus.edu","email_verified":"true"}"#,
        )
        .expect("parse");
        assert!(claims.email_verified);

        let claims: UserInfoClaims =
            serde_json::from_str(r#"{"sub":"kc-1","email_verified":false}"#).expect("parse");
        assert!(!claims.email_verified);

        let identity: ExternalIdentity = serde_json::from_str::<UserInfoClaims>(r#"{"sub":"kc-2"}"#)
            .expect("parse")
            .into();
        assert!(!identity.email_verified);
        assert!(identity.email.is_none());
    }
}
