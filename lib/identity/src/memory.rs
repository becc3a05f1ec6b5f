//! In-process implementations of the store and provider traits.
//!
//! Used by this crate's tests and the server's router tests. The stores
//! enforce the same uniqueness rules as the PostgreSQL schema, under a single
//! mutex, so the concurrency properties hold against them too.

use async_trait::async_trait;
use campus_sso_core::{SsoLinkId, UserId};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{ProviderError, StoreError};
use crate::link::{Provider, Secret, SsoLink, TokenSet};
use crate::provider::{ExternalIdentity, IdentityProvider, TokenGrant};
use crate::state::{AuthorizationState, StateCheck, StateStore, code_challenge};
use crate::store::{AccountCreation, LinkRemoval, LinkStore, Upserted, UserDirectory};
use crate::user::{User, normalize_email};

#[derive(Debug, Default)]
struct Directory {
    users: HashMap<UserId, User>,
    links: HashMap<SsoLinkId, SsoLink>,
    write_delay: std::time::Duration,
}

impl Directory {
    fn user_by_email(&self, email: &str) -> Option<&User> {
        let email = normalize_email(email);
        self.users.values().find(|u| u.email() == email)
    }

    fn link_by_subject(&self, provider: Provider, provider_id: &str) -> Option<&SsoLink> {
        self.links
            .values()
            .find(|l| l.provider() == provider && l.provider_id() == provider_id)
    }

    fn link_for_user(&self, user_id: UserId, provider: Provider) -> Option<&SsoLink> {
        self.links
            .values()
            .find(|l| l.user_id() == user_id && l.provider() == provider)
    }
}

/// Users and links held in memory.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    inner: Mutex<Directory>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Directory>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Backend {
            reason: "identity store lock poisoned".to_string(),
        })
    }

    /// Number of stored users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.lock().map(|d| d.users.len()).unwrap_or_default()
    }

    /// Number of stored links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.lock().map(|d| d.links.len()).unwrap_or_default()
    }

    /// Delays every token write by `delay`, to simulate a slow database.
    pub fn set_write_delay(&self, delay: std::time::Duration) -> Result<(), StoreError> {
        self.lock()?.write_delay = delay;
        Ok(())
    }

    /// Replaces a stored user, e.g. to deactivate it.
    pub fn put_user(&self, user: User) -> Result<(), StoreError> {
        self.lock()?.users.insert(user.id(), user);
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryIdentityStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.lock()?.user_by_email(email).cloned())
    }

    async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        let mut dir = self.lock()?;
        if dir.user_by_email(user.email()).is_some() {
            return Err(StoreError::Conflict {
                reason: "email already registered".to_string(),
            });
        }
        dir.users.insert(user.id(), user.clone());
        Ok(user)
    }
}

#[async_trait]
impl LinkStore for MemoryIdentityStore {
    async fn get(
        &self,
        user_id: UserId,
        provider: Provider,
    ) -> Result<Option<SsoLink>, StoreError> {
        Ok(self.lock()?.link_for_user(user_id, provider).cloned())
    }

    async fn find_by_provider_subject(
        &self,
        provider: Provider,
        provider_id: &str,
    ) -> Result<Option<SsoLink>, StoreError> {
        Ok(self.lock()?.link_by_subject(provider, provider_id).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<SsoLink>, StoreError> {
        let dir = self.lock()?;
        let mut links: Vec<SsoLink> = dir
            .links
            .values()
            .filter(|l| l.user_id() == user_id)
            .cloned()
            .collect();
        links.sort_by_key(SsoLink::provider);
        Ok(links)
    }

    async fn upsert_by_provider_subject(
        &self,
        provider: Provider,
        provider_id: &str,
        user_id: UserId,
        tokens: TokenSet,
    ) -> Result<Upserted, StoreError> {
        let mut dir = self.lock()?;
        if let Some(existing) = dir.link_by_subject(provider, provider_id) {
            return Ok(Upserted {
                link: existing.clone(),
                created: false,
            });
        }
        if dir.link_for_user(user_id, provider).is_some() {
            return Err(StoreError::Conflict {
                reason: format!("user already holds a {provider} link"),
            });
        }
        if !dir.users.contains_key(&user_id) {
            return Err(StoreError::NotFound { entity: "user" });
        }

        let link = SsoLink::new(user_id, provider, provider_id.to_string(), tokens);
        dir.links.insert(link.id(), link.clone());
        Ok(Upserted {
            link,
            created: true,
        })
    }

    async fn create_user_with_link(
        &self,
        user: User,
        provider: Provider,
        provider_id: &str,
        tokens: TokenSet,
    ) -> Result<AccountCreation, StoreError> {
        let mut dir = self.lock()?;
        if let Some(existing) = dir.link_by_subject(provider, provider_id) {
            return Ok(AccountCreation::AlreadyLinked {
                link: existing.clone(),
            });
        }
        if dir.user_by_email(user.email()).is_some() {
            return Err(StoreError::Conflict {
                reason: "email already registered".to_string(),
            });
        }

        let link = SsoLink::new(user.id(), provider, provider_id.to_string(), tokens);
        dir.users.insert(user.id(), user.clone());
        dir.links.insert(link.id(), link.clone());
        Ok(AccountCreation::Created { user, link })
    }

    async fn update_tokens(&self, id: SsoLinkId, tokens: TokenSet) -> Result<SsoLink, StoreError> {
        let delay = self.lock()?.write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut dir = self.lock()?;
        let link = dir
            .links
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "sso link" })?;
        link.set_tokens(tokens);
        Ok(link.clone())
    }

    async fn mark_reauth_required(&self, id: SsoLinkId) -> Result<(), StoreError> {
        let mut dir = self.lock()?;
        let link = dir
            .links
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "sso link" })?;
        link.mark_reauth_required();
        Ok(())
    }

    async fn delete(&self, id: SsoLinkId) -> Result<(), StoreError> {
        self.lock()?
            .links
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound { entity: "sso link" })
    }

    async fn delete_unless_last(&self, id: SsoLinkId) -> Result<LinkRemoval, StoreError> {
        let mut dir = self.lock()?;
        let owner = dir
            .links
            .get(&id)
            .map(SsoLink::user_id)
            .ok_or(StoreError::NotFound { entity: "sso link" })?;
        if dir.links.values().filter(|l| l.user_id() == owner).count() <= 1 {
            return Ok(LinkRemoval::LastLink);
        }
        dir.links.remove(&id);
        Ok(LinkRemoval::Removed)
    }
}

/// Authorization states held in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, AuthorizationState>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, AuthorizationState>>, StoreError> {
        self.states.lock().map_err(|_| StoreError::Backend {
            reason: "state store lock poisoned".to_string(),
        })
    }

    /// Number of states currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn issue(&self, state: AuthorizationState) -> Result<(), StoreError> {
        self.lock()?.insert(state.state().to_string(), state);
        Ok(())
    }

    async fn consume(
        &self,
        state: &str,
        binding: &str,
        provider: Provider,
        code_fingerprint: &str,
    ) -> Result<StateCheck, StoreError> {
        let mut states = self.lock()?;
        Ok(match states.get_mut(state) {
            Some(pending) => pending.check(binding, provider, code_fingerprint, Utc::now()),
            None => StateCheck::Invalid,
        })
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut states = self.lock()?;
        let before = states.len();
        states.retain(|_, s| !s.is_purgeable(now));
        Ok((before - states.len()) as u64)
    }
}

#[derive(Debug)]
struct PendingCode {
    identity: ExternalIdentity,
    challenge: Option<String>,
}

#[derive(Debug)]
struct Idp {
    next: u64,
    challenges: HashMap<String, String>,
    codes: HashMap<String, PendingCode>,
    access_tokens: HashMap<String, ExternalIdentity>,
    refresh_tokens: HashMap<String, ExternalIdentity>,
    revoked: Vec<String>,
    rotate_refresh_tokens: bool,
    issue_refresh_tokens: bool,
    token_lifetime: Duration,
    refresh_delay: std::time::Duration,
    unavailable: bool,
}

impl Default for Idp {
    fn default() -> Self {
        Self {
            next: 0,
            challenges: HashMap::new(),
            codes: HashMap::new(),
            access_tokens: HashMap::new(),
            refresh_tokens: HashMap::new(),
            revoked: Vec::new(),
            rotate_refresh_tokens: true,
            issue_refresh_tokens: true,
            token_lifetime: Duration::minutes(5),
            refresh_delay: std::time::Duration::ZERO,
            unavailable: false,
        }
    }
}

impl Idp {
    fn mint(&mut self, prefix: &str) -> String {
        self.next += 1;
        format!("{prefix}-{}", self.next)
    }

    fn grant(&mut self, identity: &ExternalIdentity, with_refresh: bool) -> TokenGrant {
        let access = self.mint("at");
        self.access_tokens.insert(access.clone(), identity.clone());
        let refresh = with_refresh.then(|| {
            let refresh = self.mint("rt");
            self.refresh_tokens.insert(refresh.clone(), identity.clone());
            Secret::new(refresh)
        });
        TokenGrant::new(Secret::new(access), refresh, Some(self.token_lifetime))
    }
}

/// A scripted identity provider.
///
/// Authorization codes are single use. Refresh tokens rotate by default, and
/// a rotated-out refresh token is rejected with `InvalidGrant` exactly as a
/// rotating IdP would.
#[derive(Debug)]
pub struct MemoryProvider {
    provider: Provider,
    idp: Mutex<Idp>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MemoryProvider {
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            idp: Mutex::new(Idp::default()),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Idp>, ProviderError> {
        self.idp.lock().map_err(|_| ProviderError::Unavailable {
            reason: "provider lock poisoned".to_string(),
        })
    }

    fn with_idp(&self, f: impl FnOnce(&mut Idp)) {
        if let Ok(mut idp) = self.idp.lock() {
            f(&mut idp);
        }
    }

    /// Simulates the user approving the request identified by `state` and
    /// returns the authorization code the IdP would redirect back with.
    pub fn authorize(&self, state: &str, identity: ExternalIdentity) -> String {
        let mut code = String::new();
        self.with_idp(|idp| {
            code = idp.mint("code");
            let challenge = idp.challenges.remove(state);
            idp.codes
                .insert(code.clone(), PendingCode { identity, challenge });
        });
        code
    }

    /// Issues a token grant directly, bypassing the authorization step.
    pub fn issue_tokens(&self, identity: &ExternalIdentity) -> Option<TokenGrant> {
        let mut grant = None;
        self.with_idp(|idp| {
            let with_refresh = idp.issue_refresh_tokens;
            grant = Some(idp.grant(identity, with_refresh));
        });
        grant
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_idp(|idp| idp.unavailable = unavailable);
    }

    pub fn set_rotate_refresh_tokens(&self, rotate: bool) {
        self.with_idp(|idp| idp.rotate_refresh_tokens = rotate);
    }

    pub fn set_issue_refresh_tokens(&self, issue: bool) {
        self.with_idp(|idp| idp.issue_refresh_tokens = issue);
    }

    pub fn set_token_lifetime(&self, lifetime: Duration) {
        self.with_idp(|idp| idp.token_lifetime = lifetime);
    }

    /// Makes each refresh call wait before answering, widening race windows.
    pub fn set_refresh_delay(&self, delay: std::time::Duration) {
        self.with_idp(|idp| idp.refresh_delay = delay);
    }

    #[must_use]
    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Tokens revoked through [`IdentityProvider::revoke`].
    #[must_use]
    pub fn revoked(&self) -> Vec<String> {
        let mut revoked = Vec::new();
        self.with_idp(|idp| revoked.clone_from(&idp.revoked));
        revoked
    }
}

#[async_trait]
impl IdentityProvider for MemoryProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn authorization_url(&self, state: &str, pkce_verifier: &str) -> String {
        let challenge = code_challenge(pkce_verifier);
        self.with_idp(|idp| {
            idp.challenges.insert(state.to_string(), challenge.clone());
        });
        format!(
            "https://idp.test/{}/auth?response_type=code&state={state}&code_challenge={challenge}&code_challenge_method=S256",
            self.provider
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let mut idp = self.lock()?;
        if idp.unavailable {
            return Err(ProviderError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }

        let pending = idp
            .codes
            .remove(code)
            .ok_or_else(|| ProviderError::InvalidGrant {
                reason: "code not valid".to_string(),
            })?;
        if pending
            .challenge
            .as_ref()
            .is_some_and(|challenge| *challenge != code_challenge(pkce_verifier))
        {
            return Err(ProviderError::InvalidGrant {
                reason: "PKCE verification failed".to_string(),
            });
        }

        let with_refresh = idp.issue_refresh_tokens;
        Ok(idp.grant(&pending.identity, with_refresh))
    }

    async fn fetch_identity(
        &self,
        access_token: &Secret,
    ) -> Result<ExternalIdentity, ProviderError> {
        let idp = self.lock()?;
        if idp.unavailable {
            return Err(ProviderError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        idp.access_tokens
            .get(access_token.expose())
            .cloned()
            .ok_or_else(|| ProviderError::Unauthorized {
                reason: "token not active".to_string(),
            })
    }

    async fn refresh(&self, refresh_token: &Secret) -> Result<TokenGrant, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.lock()?.refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut idp = self.lock()?;
        if idp.unavailable {
            return Err(ProviderError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }

        let identity = if idp.rotate_refresh_tokens {
            idp.refresh_tokens.remove(refresh_token.expose())
        } else {
            idp.refresh_tokens.get(refresh_token.expose()).cloned()
        }
        .ok_or_else(|| ProviderError::InvalidGrant {
            reason: "refresh token not active".to_string(),
        })?;

        let rotate = idp.rotate_refresh_tokens;
        Ok(idp.grant(&identity, rotate))
    }

    async fn revoke(&self, token: &Secret) -> Result<(), ProviderError> {
        let mut idp = self.lock()?;
        if idp.unavailable {
            return Err(ProviderError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        idp.refresh_tokens.remove(token.expose());
        idp.access_tokens.remove(token.expose());
        idp.revoked.push(token.expose().to_string());
        Ok(())
    }
}
