//! Route handlers for federated sign-in and link management.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use campus_sso_identity::{
    CallbackParams, LinkSummary, Provider, SignIn, UserProfile, state::generate_binding,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use time::Duration as TimeDuration;

use super::{AppState, RequireAuth};
use crate::error::ApiError;

/// Browser binding cookie name.
const BINDING_COOKIE: &str = "sso_binding";

/// The binding cookie only has to reach the SSO routes.
const BINDING_COOKIE_PATH: &str = "/auth/sso";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationUrlResponse {
    pub auth_url: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    pub session_credential: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

impl From<SignIn> for SignInResponse {
    fn from(sign_in: SignIn) -> Self {
        Self {
            expires_at: sign_in.credential.claims.expires_at(),
            session_credential: sign_in.credential.token,
            user: sign_in.user,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    /// Seconds until the provider access token expires.
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    pub refreshed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableProvider {
    pub provider: Provider,
    pub auth_url: String,
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub linked: Vec<LinkSummary>,
    pub available: Vec<AvailableProvider>,
}

fn parse_provider(name: &str) -> Result<Provider, ApiError> {
    Ok(Provider::from_str(name)?)
}

/// Returns the browser's binding nonce, minting and setting a cookie if absent.
fn browser_binding(jar: CookieJar, secure: bool) -> (CookieJar, String) {
    if let Some(value) = jar
        .get(BINDING_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
    {
        return (jar, value);
    }

    let binding = generate_binding();
    let cookie = Cookie::build((BINDING_COOKIE, binding.clone()))
        .path(BINDING_COOKIE_PATH)
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(TimeDuration::days(30));
    (jar.add(cookie), binding)
}

fn failure_location(target: &str, code: &str) -> String {
    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{target}{separator}error={code}")
}

/// Liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}

/// Starts an authorization flow and returns the provider URL to visit.
pub async fn authorization_url(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<AuthorizationUrlResponse>), ApiError> {
    let provider = parse_provider(&provider)?;
    let (jar, binding) = browser_binding(jar, state.sso_config.secure_cookies);
    let start = state.orchestrator.begin(provider, &binding).await?;

    Ok((
        jar,
        Json(AuthorizationUrlResponse {
            auth_url: start.auth_url,
            state: start.state,
        }),
    ))
}

/// Handles the provider's redirect back to the portal.
///
/// Failures are returned as JSON unless a failure redirect is configured, in
/// which case the browser is sent there with the error code.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    // A missing binding cookie can never match a stored state.
    let binding = jar
        .get(BINDING_COOKIE)
        .map(|c| c.value().to_string())
        .unwrap_or_default();

    let outcome = match Provider::from_str(&provider) {
        Ok(provider) => state.orchestrator.complete(provider, &binding, params).await,
        Err(err) => Err(err),
    };

    match outcome {
        Ok(sign_in) => Json(SignInResponse::from(sign_in)).into_response(),
        Err(err) => match &state.sso_config.failure_redirect {
            Some(target) => Redirect::to(&failure_location(target, err.code())).into_response(),
            None => ApiError(err).into_response(),
        },
    }
}

/// Refreshes the caller's provider tokens if they are close to expiry.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    RequireAuth(auth): RequireAuth,
    Path(provider): Path<String>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let provider = parse_provider(&provider)?;
    let fresh = state.refresh.ensure_fresh(auth.user_id(), provider).await?;

    Ok(Json(RefreshResponse {
        expires_in: fresh.expires_in.num_seconds(),
        expires_at: fresh.expires_at,
        refreshed: fresh.refreshed,
    }))
}

/// Removes the caller's link to a provider.
pub async fn unlink(
    State(state): State<Arc<AppState>>,
    RequireAuth(auth): RequireAuth,
    Path(provider): Path<String>,
) -> Result<StatusCode, ApiError> {
    let provider = parse_provider(&provider)?;
    state.links.unlink(auth.user_id(), provider).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Lists the caller's links and the providers they can (re)authorize with.
///
/// A provider is offered when it is not linked yet or its link needs
/// re-authorization. Each offer carries a freshly issued authorization URL.
pub async fn providers(
    State(state): State<Arc<AppState>>,
    RequireAuth(auth): RequireAuth,
    jar: CookieJar,
) -> Result<(CookieJar, Json<ProvidersResponse>), ApiError> {
    let overview = state.links.overview(auth.user_id()).await?;
    let (jar, binding) = browser_binding(jar, state.sso_config.secure_cookies);

    let mut available = Vec::new();
    for provider in overview.available {
        let usable = overview
            .linked
            .iter()
            .any(|link| link.provider == provider && !link.reauth_required);
        if usable {
            continue;
        }
        let start = state.orchestrator.begin(provider, &binding).await?;
        available.push(AvailableProvider {
            provider,
            auth_url: start.auth_url,
        });
    }

    Ok((
        jar,
        Json(ProvidersResponse {
            linked: overview.linked,
            available,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::router;
    use crate::config::SsoConfig;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request, header},
    };
    use campus_sso_identity::memory::{MemoryIdentityStore, MemoryProvider, MemoryStateStore};
    use campus_sso_identity::{ExternalIdentity, ProviderRegistry, SessionIssuer};
    use chrono::Duration;
    use serde_json::Value;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        keycloak: Arc<MemoryProvider>,
        store: Arc<MemoryIdentityStore>,
    }

    fn harness(sso_config: SsoConfig) -> Harness {
        let store = Arc::new(MemoryIdentityStore::new());
        let keycloak = Arc::new(MemoryProvider::new(Provider::Keycloak));
        let google = Arc::new(MemoryProvider::new(Provider::Google));
        let providers = Arc::new(
            ProviderRegistry::new()
                .register(keycloak.clone())
                .register(google),
        );
        let sessions = Arc::new(SessionIssuer::new(
            b"test-signing-secret",
            "campus-sso",
            Duration::minutes(30),
        ));
        let state = AppState::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryStateStore::new()),
            providers,
            sessions,
            sso_config,
        );
        Harness {
            app: router(Arc::new(state)),
            keycloak,
            store,
        }
    }

    fn identity() -> ExternalIdentity {
        ExternalIdentity {
            subject: "kc-ada".to_string(),
            email: Some("Ada@Campus.edu".to_string()),
            email_verified: true,
            given_name: Some("Ada".to_string()),
            family_name: Some("Lovelace".to_string()),
            ..ExternalIdentity::default()
        }
    }

    fn request(method: Method, uri: &str, headers: &[(header::HeaderName, &str)]) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(name, *value);
        }
        builder.body(Body::empty()).expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    impl Harness {
        async fn send(&self, request: Request<Body>) -> Response {
            self.app.clone().oneshot(request).await.expect("infallible")
        }

        /// Starts a Keycloak flow; returns the state and the binding cookie.
        async fn start(&self) -> (String, String) {
            let response = self
                .send(request(
                    Method::GET,
                    "/auth/sso/keycloak/authorization-url",
                    &[],
                ))
                .await;
            assert_eq!(response.status(), StatusCode::OK);

            let cookie = response
                .headers()
                .get(header::SET_COOKIE)
                .expect("binding cookie")
                .to_str()
                .expect("ascii")
                .split(';')
                .next()
                .expect("pair")
                .to_string();
            let body = json_body(response).await;
            assert!(
                body["authUrl"]
                    .as_str()
                    .expect("authUrl")
                    .contains("code_challenge_method=S256")
            );
            (body["state"].as_str().expect("state").to_string(), cookie)
        }

        async fn callback(&self, code: &str, state: &str, cookie: Option<&str>) -> Response {
            let uri = format!("/auth/sso/keycloak/callback?code={code}&state={state}");
            let headers: Vec<(header::HeaderName, &str)> = cookie
                .map(|c| vec![(header::COOKIE, c)])
                .unwrap_or_default();
            self.send(request(Method::GET, &uri, &headers)).await
        }

        /// Completes a full sign-in and returns the session token.
        async fn sign_in(&self) -> String {
            let (state, cookie) = self.start().await;
            let code = self.keycloak.authorize(&state, identity());
            let response = self.callback(&code, &state, Some(cookie.as_str())).await;
            assert_eq!(response.status(), StatusCode::OK);
            json_body(response).await["sessionCredential"]
                .as_str()
                .expect("credential")
                .to_string()
        }
    }

    #[tokio::test]
    async fn healthz_responds() {
        let h = harness(SsoConfig::default());
        let response = h.send(request(Method::GET, "/healthz", &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn callback_signs_in_new_account() {
        let h = harness(SsoConfig::default());
        let (state, cookie) = h.start().await;
        let code = h.keycloak.authorize(&state, identity());

        let response = h.callback(&code, &state, Some(cookie.as_str())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert!(body["sessionCredential"].as_str().is_some());
        assert!(body["expiresAt"].as_str().is_some());
        assert_eq!(body["user"]["email"], "ada@campus.edu");
        assert_eq!(body["user"]["role"], "student");
        assert!(body.get("accessToken").is_none());
        assert_eq!(h.store.user_count(), 1);
        assert_eq!(h.store.link_count(), 1);
    }

    #[tokio::test]
    async fn callback_without_binding_cookie_is_invalid_state() {
        let h = harness(SsoConfig::default());
        let (state, _cookie) = h.start().await;
        let code = h.keycloak.authorize(&state, identity());

        let response = h.callback(&code, &state, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_state");
        assert_eq!(h.keycloak.exchange_calls(), 0);
    }

    #[tokio::test]
    async fn replayed_callback_is_invalid_grant() {
        let h = harness(SsoConfig::default());
        let (state, cookie) = h.start().await;
        let code = h.keycloak.authorize(&state, identity());

        let first = h.callback(&code, &state, Some(cookie.as_str())).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = h.callback(&code, &state, Some(cookie.as_str())).await;
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(second).await["error"], "invalid_grant");
        assert_eq!(h.keycloak.exchange_calls(), 1);
        assert_eq!(h.store.link_count(), 1);
    }

    #[tokio::test]
    async fn denied_callback_redirects_when_configured() {
        let h = harness(SsoConfig {
            failure_redirect: Some("https://portal.campus.example/login".to_string()),
            ..SsoConfig::default()
        });
        let (state, cookie) = h.start().await;

        let uri = format!("/auth/sso/keycloak/callback?error=access_denied&state={state}");
        let response = h
            .send(request(Method::GET, &uri, &[(header::COOKIE, cookie.as_str())]))
            .await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).expect("location"),
            "https://portal.campus.example/login?error=authorization_denied"
        );
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let h = harness(SsoConfig::default());
        let response = h
            .send(request(Method::GET, "/auth/sso/github/authorization-url", &[]))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "unknown_provider");
    }

    #[tokio::test]
    async fn authenticated_routes_require_bearer_session() {
        let h = harness(SsoConfig::default());

        let missing = h
            .send(request(Method::POST, "/auth/sso/keycloak/refresh", &[]))
            .await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let forged = h
            .send(request(
                Method::GET,
                "/auth/sso/providers",
                &[(header::AUTHORIZATION, "Bearer not-a-token")],
            ))
            .await;
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(forged).await["error"], "invalid_credential");
    }

    #[tokio::test]
    async fn refresh_reports_expiry_without_tokens() {
        let h = harness(SsoConfig::default());
        let token = h.sign_in().await;
        let bearer = format!("Bearer {token}");

        let response = h
            .send(request(
                Method::POST,
                "/auth/sso/keycloak/refresh",
                &[(header::AUTHORIZATION, bearer.as_str())],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert!(body["expiresIn"].as_i64().expect("expiresIn") > 0);
        assert_eq!(body["refreshed"], false);
        assert!(body.get("accessToken").is_none());
        assert_eq!(h.keycloak.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn providers_lists_links_and_offers_unlinked_providers() {
        let h = harness(SsoConfig::default());
        let token = h.sign_in().await;
        let bearer = format!("Bearer {token}");

        let response = h
            .send(request(
                Method::GET,
                "/auth/sso/providers",
                &[(header::AUTHORIZATION, bearer.as_str())],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let linked = body["linked"].as_array().expect("linked");
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0]["provider"], "keycloak");
        assert_eq!(linked[0]["reauthRequired"], false);

        let available = body["available"].as_array().expect("available");
        assert_eq!(available.len(), 1);
        assert_eq!(available[0]["provider"], "google");
        assert!(
            available[0]["authUrl"]
                .as_str()
                .expect("authUrl")
                .starts_with("https://idp.test/google/auth")
        );
    }

    #[tokio::test]
    async fn last_login_method_cannot_be_unlinked() {
        let h = harness(SsoConfig::default());
        let token = h.sign_in().await;
        let bearer = format!("Bearer {token}");

        let response = h
            .send(request(
                Method::DELETE,
                "/auth/sso/keycloak",
                &[(header::AUTHORIZATION, bearer.as_str())],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "last_login_method");
        assert_eq!(h.store.link_count(), 1);
    }

    #[tokio::test]
    async fn unlinking_missing_link_is_not_found() {
        let h = harness(SsoConfig::default());
        let token = h.sign_in().await;
        let bearer = format!("Bearer {token}");

        let response = h
            .send(request(
                Method::DELETE,
                "/auth/sso/google",
                &[(header::AUTHORIZATION, bearer.as_str())],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "link_not_found");
    }

    #[test]
    fn failure_location_appends_error_code() {
        assert_eq!(
            failure_location("https://portal.example/login", "invalid_state"),
            "https://portal.example/login?error=invalid_state"
        );
        assert_eq!(
            failure_location("https://portal.example/login?next=/home", "invalid_grant"),
            "https://portal.example/login?next=/home&error=invalid_grant"
        );
    }
}
