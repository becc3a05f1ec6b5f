//! Unlinking and listing a user's SSO links.

use campus_sso_core::UserId;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::{SsoError, StoreError};
use crate::link::{LinkSummary, Provider};
use crate::provider::ProviderRegistry;
use crate::store::{LinkRemoval, LinkStore, UserDirectory};

/// A user's links and the providers they could link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOverview {
    pub linked: Vec<LinkSummary>,
    pub available: Vec<Provider>,
}

/// Manages links on behalf of an authenticated user.
#[derive(Clone)]
pub struct LinkService {
    users: Arc<dyn UserDirectory>,
    links: Arc<dyn LinkStore>,
    providers: Arc<ProviderRegistry>,
}

impl LinkService {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserDirectory>,
        links: Arc<dyn LinkStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            users,
            links,
            providers,
        }
    }

    /// Removes the user's link to `provider` and revokes its tokens at the IdP.
    ///
    /// The user record and any other links are untouched. Revocation is best
    /// effort: a failure is logged and the unlink still succeeds.
    ///
    /// # Errors
    ///
    /// - `LinkNotFound` if there is no such link
    /// - `LastLoginMethod` if this is the only link of an account without a usable password
    #[instrument(skip_all, fields(user_id = %user_id, provider = %provider))]
    pub async fn unlink(&self, user_id: UserId, provider: Provider) -> Result<(), SsoError> {
        let link = self
            .links
            .get(user_id, provider)
            .await?
            .ok_or(SsoError::LinkNotFound { provider })?;
        let user = self
            .users
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| SsoError::Internal {
                reason: format!("link {} has no owning user", link.id()),
            })?;

        let removed = if user.has_usable_password() {
            self.links.delete(link.id()).await.map(|()| LinkRemoval::Removed)
        } else {
            self.links.delete_unless_last(link.id()).await
        };
        match removed {
            Ok(LinkRemoval::Removed) => {}
            Ok(LinkRemoval::LastLink) => return Err(SsoError::LastLoginMethod { provider }),
            Err(StoreError::NotFound { .. }) => return Err(SsoError::LinkNotFound { provider }),
            Err(err) => return Err(err.into()),
        }
        info!(link_id = %link.id(), "unlinked provider");

        let token = link
            .tokens()
            .refresh_token()
            .unwrap_or_else(|| link.tokens().access_token());
        match self.providers.get(provider) {
            Ok(client) => {
                if let Err(error) = client.revoke(token).await {
                    warn!(%error, "token revocation failed; link already removed");
                }
            }
            Err(error) => warn!(%error, "cannot revoke tokens for unconfigured provider"),
        }
        Ok(())
    }

    /// Lists the user's links and the configured providers.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on backend failure.
    pub async fn overview(&self, user_id: UserId) -> Result<LinkOverview, SsoError> {
        let linked = self
            .links
            .list_for_user(user_id)
            .await?
            .iter()
            .map(|link| link.summary())
            .collect();
        Ok(LinkOverview {
            linked,
            available: self.providers.available(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Secret, SsoLink, TokenSet};
    use crate::memory::{MemoryIdentityStore, MemoryProvider};
    use crate::store::{AccountCreation, Upserted};
    use crate::user::{NewUser, PasswordState, User};
    use async_trait::async_trait;
    use campus_sso_core::SsoLinkId;
    use chrono::{Duration, Utc};
    use tokio::task::yield_now;

    /// Yields to the scheduler before every call so concurrent unlinks interleave.
    struct Interleaving(Arc<MemoryIdentityStore>);

    #[async_trait]
    impl LinkStore for Interleaving {
        async fn get(
            &self,
            user_id: UserId,
            provider: Provider,
        ) -> Result<Option<SsoLink>, StoreError> {
            yield_now().await;
            self.0.get(user_id, provider).await
        }

        async fn find_by_provider_subject(
            &self,
            provider: Provider,
            provider_id: &str,
        ) -> Result<Option<SsoLink>, StoreError> {
            yield_now().await;
            self.0.find_by_provider_subject(provider, provider_id).await
        }

        async fn list_for_user(&self, user_id: UserId) -> Result<Vec<SsoLink>, StoreError> {
            yield_now().await;
            let links = self.0.list_for_user(user_id).await;
            yield_now().await;
            links
        }

        async fn upsert_by_provider_subject(
            &self,
            provider: Provider,
            provider_id: &str,
            user_id: UserId,
            tokens: TokenSet,
        ) -> Result<Upserted, StoreError> {
            yield_now().await;
            self.0
                .upsert_by_provider_subject(provider, provider_id, user_id, tokens)
                .await
        }

        async fn create_user_with_link(
            &self,
            user: User,
            provider: Provider,
            provider_id: &str,
            tokens: TokenSet,
        ) -> Result<AccountCreation, StoreError> {
            yield_now().await;
            self.0
                .create_user_with_link(user, provider, provider_id, tokens)
                .await
        }

        async fn update_tokens(
            &self,
            id: SsoLinkId,
            tokens: TokenSet,
        ) -> Result<SsoLink, StoreError> {
            yield_now().await;
            self.0.update_tokens(id, tokens).await
        }

        async fn mark_reauth_required(&self, id: SsoLinkId) -> Result<(), StoreError> {
            yield_now().await;
            self.0.mark_reauth_required(id).await
        }

        async fn delete(&self, id: SsoLinkId) -> Result<(), StoreError> {
            yield_now().await;
            self.0.delete(id).await
        }

        async fn delete_unless_last(&self, id: SsoLinkId) -> Result<LinkRemoval, StoreError> {
            yield_now().await;
            self.0.delete_unless_last(id).await
        }
    }

    struct Fixture {
        store: Arc<MemoryIdentityStore>,
        keycloak: Arc<MemoryProvider>,
        google: Arc<MemoryProvider>,
        service: LinkService,
        user: User,
    }

    fn tokens(tag: &str) -> TokenSet {
        TokenSet::new(
            Secret::new(format!("at-{tag}")),
            Some(Secret::new(format!("rt-{tag}"))),
            Utc::now() + Duration::minutes(5),
        )
    }

    async fn fixture(password: Option<&str>, providers: &[Provider]) -> Fixture {
        let store = Arc::new(MemoryIdentityStore::new());
        let keycloak = Arc::new(MemoryProvider::new(Provider::Keycloak));
        let google = Arc::new(MemoryProvider::new(Provider::Google));
        let registry = Arc::new(
            ProviderRegistry::new()
                .register(keycloak.clone())
                .register(google.clone()),
        );
        let service = LinkService::new(store.clone(), store.clone(), registry);

        let mut user = User::federated(NewUser {
            email: "ada@campus.edu".to_string(),
            ..NewUser::default()
        });
        if let Some(password) = password {
            user.set_password(PasswordState::hash(password).expect("hash"));
        }
        let user = store.create_user(user).await.expect("user");
        for provider in providers {
            store
                .upsert_by_provider_subject(
                    *provider,
                    &format!("{provider}-sub"),
                    user.id(),
                    tokens(provider.as_str()),
                )
                .await
                .expect("link");
        }

        Fixture {
            store,
            keycloak,
            google,
            service,
            user,
        }
    }

    #[tokio::test]
    async fn unlink_removes_only_the_target_link() {
        let f = fixture(None, &[Provider::Keycloak, Provider::Google]).await;

        f.service
            .unlink(f.user.id(), Provider::Google)
            .await
            .expect("unlink");

        let remaining = f.store.list_for_user(f.user.id()).await.expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].provider(), Provider::Keycloak);
        assert!(
            f.store
                .find_user_by_id(f.user.id())
                .await
                .expect("find")
                .is_some()
        );
        assert_eq!(f.google.revoked(), vec!["rt-google".to_string()]);
        assert!(f.keycloak.revoked().is_empty());
    }

    #[tokio::test]
    async fn unlink_missing_link_is_not_found() {
        let f = fixture(None, &[Provider::Keycloak]).await;

        let err = f
            .service
            .unlink(f.user.id(), Provider::Google)
            .await
            .expect_err("missing");
        assert_eq!(
            err,
            SsoError::LinkNotFound {
                provider: Provider::Google
            }
        );
    }

    #[tokio::test]
    async fn last_link_of_passwordless_account_is_kept() {
        let f = fixture(None, &[Provider::Keycloak]).await;

        let err = f
            .service
            .unlink(f.user.id(), Provider::Keycloak)
            .await
            .expect_err("last login method");
        assert_eq!(
            err,
            SsoError::LastLoginMethod {
                provider: Provider::Keycloak
            }
        );
        assert_eq!(f.store.link_count(), 1);
    }

    #[tokio::test]
    async fn last_link_can_go_when_password_is_set() {
        let f = fixture(Some("correct horse"), &[Provider::Keycloak]).await;

        f.service
            .unlink(f.user.id(), Provider::Keycloak)
            .await
            .expect("unlink");
        assert_eq!(f.store.link_count(), 0);
        assert_eq!(f.store.user_count(), 1);
    }

    #[tokio::test]
    async fn revocation_failure_does_not_block_unlink() {
        let f = fixture(None, &[Provider::Keycloak, Provider::Google]).await;
        f.keycloak.set_unavailable(true);

        f.service
            .unlink(f.user.id(), Provider::Keycloak)
            .await
            .expect("unlink");
        assert!(
            f.store
                .get(f.user.id(), Provider::Keycloak)
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn overview_lists_links_and_providers() {
        let f = fixture(None, &[Provider::Google]).await;

        let overview = f.service.overview(f.user.id()).await.expect("overview");

        assert_eq!(overview.linked.len(), 1);
        assert_eq!(overview.linked[0].provider, Provider::Google);
        assert_eq!(
            overview.available,
            vec![Provider::Keycloak, Provider::Google]
        );
    }

    #[tokio::test]
    async fn concurrent_unlinks_keep_one_login_method() {
        let f = fixture(None, &[Provider::Keycloak, Provider::Google]).await;
        let registry = Arc::new(
            ProviderRegistry::new()
                .register(f.keycloak.clone())
                .register(f.google.clone()),
        );
        let service = LinkService::new(
            f.store.clone(),
            Arc::new(Interleaving(f.store.clone())),
            registry,
        );

        let (keycloak, google) = tokio::join!(
            service.unlink(f.user.id(), Provider::Keycloak),
            service.unlink(f.user.id(), Provider::Google),
        );

        let outcomes = [keycloak, google];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            outcomes
                .iter()
                .any(|r| matches!(r, Err(SsoError::LastLoginMethod { .. })))
        );
        assert_eq!(f.store.link_count(), 1);
    }

    #[tokio::test]
    async fn guarded_delete_reports_missing_link() {
        let f = fixture(None, &[Provider::Keycloak, Provider::Google]).await;
        let link = f
            .store
            .get(f.user.id(), Provider::Google)
            .await
            .expect("get")
            .expect("link");

        assert_eq!(
            f.store.delete_unless_last(link.id()).await,
            Ok(LinkRemoval::Removed)
        );
        assert_eq!(
            f.store.delete_unless_last(link.id()).await,
            Err(StoreError::NotFound { entity: "sso link" })
        );
    }
}
