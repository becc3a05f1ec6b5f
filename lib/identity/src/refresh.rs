//! Refresh coordination.
//!
//! At most one provider refresh is in flight per `(user, provider)`. Callers
//! take a per-key async lock, re-read the link, and only call the IdP if the
//! stored access token is inside the expiry margin. Callers that queued behind
//! a refresh find the new tokens on re-read and return them without another
//! IdP call, so a rotating refresh token is never redeemed twice.
//!
//! The locked section runs on its own task. A caller that times out or is
//! dropped does not abandon a redeemed refresh token: the task still stores
//! the rotated tokens before the next caller gets the lock.

use campus_sso_core::UserId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{Instrument, Span, debug, info, instrument, warn};

use crate::error::{ProviderError, SsoError};
use crate::link::{Provider, Secret, TokenSet};
use crate::provider::ProviderRegistry;
use crate::store::LinkStore;

type GuardKey = (UserId, Provider);
type GuardMap = Mutex<HashMap<GuardKey, Arc<tokio::sync::Mutex<()>>>>;

/// Token freshness as reported to API callers. Carries no token values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshTokens {
    pub expires_at: DateTime<Utc>,
    pub expires_in: Duration,
    /// True if this call performed the provider refresh.
    pub refreshed: bool,
}

/// Serializes provider refreshes per link.
pub struct RefreshCoordinator {
    links: Arc<dyn LinkStore>,
    providers: Arc<ProviderRegistry>,
    margin: Duration,
    guards: Arc<GuardMap>,
}

/// Holds a key's guard and drops the map entry once nobody else holds it.
struct Lease {
    guards: Arc<GuardMap>,
    key: GuardKey,
    mutex: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.mutex.take();
        let Ok(mut guards) = self.guards.lock() else {
            return;
        };
        if guards
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            guards.remove(&self.key);
        }
    }
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(
        links: Arc<dyn LinkStore>,
        providers: Arc<ProviderRegistry>,
        margin: Duration,
    ) -> Self {
        Self {
            links,
            providers,
            margin,
            guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys with a refresh in progress or queued.
    #[must_use]
    pub fn active_guards(&self) -> usize {
        self.guards.lock().map(|g| g.len()).unwrap_or_default()
    }

    fn lease(&self, key: GuardKey) -> Result<Lease, SsoError> {
        let mut guards = self.guards.lock().map_err(|_| SsoError::Internal {
            reason: "refresh guard map poisoned".to_string(),
        })?;
        let mutex = Arc::clone(guards.entry(key).or_default());
        Ok(Lease {
            guards: Arc::clone(&self.guards),
            key,
            mutex: Some(mutex),
        })
    }

    /// Ensures the user's tokens for `provider` are valid past the margin,
    /// refreshing them at the IdP if needed.
    ///
    /// # Errors
    ///
    /// - `LinkNotFound` if the user has no link to `provider`
    /// - `ReauthRequired` if the refresh token is missing or was rejected
    /// - `ProviderUnavailable` on transient IdP failure; safe to retry
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn ensure_fresh(
        &self,
        user_id: UserId,
        provider: Provider,
    ) -> Result<FreshTokens, SsoError> {
        let (tokens, refreshed) = self.fresh_token_set(user_id, provider).await?;
        let expires_in = (tokens.expires_at() - Utc::now()).max(Duration::zero());
        Ok(FreshTokens {
            expires_at: tokens.expires_at(),
            expires_in,
            refreshed,
        })
    }

    /// Returns a valid access token for in-process provider-backed calls.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_fresh`](Self::ensure_fresh).
    pub async fn access_token_for(
        &self,
        user_id: UserId,
        provider: Provider,
    ) -> Result<Secret, SsoError> {
        let (tokens, _) = self.fresh_token_set(user_id, provider).await?;
        Ok(tokens.access_token().clone())
    }

    async fn fresh_token_set(
        &self,
        user_id: UserId,
        provider: Provider,
    ) -> Result<(TokenSet, bool), SsoError> {
        let lease = self.lease((user_id, provider))?;
        let links = Arc::clone(&self.links);
        let providers = Arc::clone(&self.providers);
        let margin = self.margin;

        let task = tokio::spawn(
            async move {
                let outcome = match lease.mutex.as_ref() {
                    Some(mutex) => {
                        let _singleflight = mutex.lock().await;
                        refresh_locked(links.as_ref(), &providers, margin, user_id, provider)
                            .await
                    }
                    None => Err(SsoError::Internal {
                        reason: "refresh lease released early".to_string(),
                    }),
                };
                drop(lease);
                outcome
            }
            .instrument(Span::current()),
        );
        task.await.map_err(|e| SsoError::Internal {
            reason: format!("refresh task failed: {e}"),
        })?
    }
}

async fn refresh_locked(
    links: &dyn LinkStore,
    providers: &ProviderRegistry,
    margin: Duration,
    user_id: UserId,
    provider: Provider,
) -> Result<(TokenSet, bool), SsoError> {
    let link = links
        .get(user_id, provider)
        .await?
        .ok_or(SsoError::LinkNotFound { provider })?;

    if link.reauth_required() {
        return Err(SsoError::ReauthRequired { provider });
    }

    let requested_at = Utc::now();
    if !link.tokens().expires_within(requested_at, margin) {
        debug!("stored tokens still valid");
        return Ok((link.tokens().clone(), false));
    }

    let Some(refresh_token) = link.tokens().refresh_token().cloned() else {
        info!("no refresh token stored; re-authorization required");
        links.mark_reauth_required(link.id()).await?;
        return Err(SsoError::ReauthRequired { provider });
    };

    let client = providers.get(provider)?;
    match client.refresh(&refresh_token).await {
        Ok(grant) => {
            let rotated = grant.refresh_token.is_some();
            let tokens = TokenSet::from_grant(grant, requested_at, Some(refresh_token));
            let link = links.update_tokens(link.id(), tokens).await?;
            info!(rotated, expires_at = %link.tokens().expires_at(), "refreshed provider tokens");
            Ok((link.tokens().clone(), true))
        }
        Err(ProviderError::InvalidGrant { reason }) => {
            warn!(%reason, "refresh token rejected; re-authorization required");
            links.mark_reauth_required(link.id()).await?;
            Err(SsoError::ReauthRequired { provider })
        }
        Err(err) => {
            warn!(error = %err, "provider refresh failed");
            Err(err.into())
        }
    }
}
