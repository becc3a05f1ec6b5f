//! Account resolution: maps a verified external identity to one local user.
//!
//! Precedence, each step a single atomic store operation:
//!
//! 1. An existing link for `(provider, subject)` wins. Its tokens are
//!    overwritten in place.
//! 2. Otherwise, if the IdP vouches for the email, an existing user with that
//!    email gets a new link.
//! 3. Otherwise a new user and its link are created together.
//!
//! Concurrent callbacks for the same external identity are serialized by the
//! store's uniqueness on `(provider, provider_id)`: the loser of an insert race
//! gets the winner's link back and resolves to the same user. A uniqueness
//! conflict on anything else restarts resolution from step 1 once.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{SsoError, StoreError};
use crate::link::{Provider, SsoLink, TokenSet};
use crate::provider::ExternalIdentity;
use crate::store::{AccountCreation, LinkStore, UserDirectory};
use crate::user::{NewUser, User, normalize_email};

/// What to do when the IdP does not mark the asserted email as verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnverifiedEmailPolicy {
    /// Fail resolution with `EmailUnverified`.
    #[default]
    Reject,
    /// Create a new account, but only if no local user holds that email.
    /// An existing user with the email still yields `EmailUnverified`.
    CreateAccount,
}

/// Which branch resolved the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    ExistingLink { user: User, link: SsoLink },
    LinkedByEmail { user: User, link: SsoLink },
    NewAccount { user: User, link: SsoLink },
}

impl Resolution {
    #[must_use]
    pub fn user(&self) -> &User {
        match self {
            Self::ExistingLink { user, .. }
            | Self::LinkedByEmail { user, .. }
            | Self::NewAccount { user, .. } => user,
        }
    }

    #[must_use]
    pub fn link(&self) -> &SsoLink {
        match self {
            Self::ExistingLink { link, .. }
            | Self::LinkedByEmail { link, .. }
            | Self::NewAccount { link, .. } => link,
        }
    }

    #[must_use]
    pub fn into_user(self) -> User {
        match self {
            Self::ExistingLink { user, .. }
            | Self::LinkedByEmail { user, .. }
            | Self::NewAccount { user, .. } => user,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExistingLink { .. } => "existing_link",
            Self::LinkedByEmail { .. } => "linked_by_email",
            Self::NewAccount { .. } => "new_account",
        }
    }
}

/// Resolves external identities against the user directory and link store.
#[derive(Clone)]
pub struct AccountResolver {
    users: Arc<dyn UserDirectory>,
    links: Arc<dyn LinkStore>,
    policy: UnverifiedEmailPolicy,
}

/// Maps a lost write race to "try again" and everything else to an error.
fn retry_on_conflict<T>(result: Result<T, StoreError>) -> Result<Option<T>, SsoError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::Conflict { reason }) => {
            debug!(%reason, "concurrent write won the race");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

impl AccountResolver {
    #[must_use]
    pub fn new(users: Arc<dyn UserDirectory>, links: Arc<dyn LinkStore>) -> Self {
        Self {
            users,
            links,
            policy: UnverifiedEmailPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: UnverifiedEmailPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolves `identity` to exactly one active local user and stores `tokens`
    /// on the user's link.
    ///
    /// # Errors
    ///
    /// - `MissingClaim` if the subject, or the email needed for steps 2 and 3, is absent
    /// - `EmailUnverified` if the email would be needed but is not verified
    /// - `AccountAlreadyLinked` if the email's owner is linked to another subject at this provider
    /// - `AccountInactive` if the resolved user is deactivated
    /// - `Storage` on backend failure
    #[instrument(skip_all, fields(provider = %provider, subject = %identity.subject))]
    pub async fn resolve(
        &self,
        provider: Provider,
        identity: &ExternalIdentity,
        tokens: TokenSet,
    ) -> Result<Resolution, SsoError> {
        if identity.subject.trim().is_empty() {
            return Err(SsoError::MissingClaim {
                claim: "sub".to_string(),
            });
        }

        for attempt in 1..=2 {
            if let Some(resolution) = self.attempt(provider, identity, &tokens).await? {
                info!(
                    user_id = %resolution.user().id(),
                    resolution = resolution.kind(),
                    "resolved external identity"
                );
                return Ok(resolution);
            }
            debug!(attempt, "retrying account resolution");
        }

        warn!("account resolution conflicted twice");
        Err(SsoError::Storage {
            reason: "account resolution kept conflicting with concurrent writes".to_string(),
        })
    }

    async fn attempt(
        &self,
        provider: Provider,
        identity: &ExternalIdentity,
        tokens: &TokenSet,
    ) -> Result<Option<Resolution>, SsoError> {
        if let Some(link) = self
            .links
            .find_by_provider_subject(provider, &identity.subject)
            .await?
        {
            return self.existing_link(link, tokens.clone()).await;
        }

        let email = identity
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|email| !email.is_empty())
            .ok_or_else(|| SsoError::MissingClaim {
                claim: "email".to_string(),
            })?;
        let owner = self.users.find_user_by_email(&email).await?;

        if identity.email_verified {
            if let Some(user) = owner {
                return self.link_by_email(provider, identity, user, tokens).await;
            }
        } else if owner.is_some() || self.policy == UnverifiedEmailPolicy::Reject {
            warn!(%email, "refusing to trust unverified email");
            return Err(SsoError::EmailUnverified { email });
        }

        self.create_account(provider, identity, email, tokens).await
    }

    async fn existing_link(
        &self,
        link: SsoLink,
        tokens: TokenSet,
    ) -> Result<Option<Resolution>, SsoError> {
        let user = self
            .users
            .find_user_by_id(link.user_id())
            .await?
            .ok_or_else(|| SsoError::Internal {
                reason: format!("link {} has no owning user", link.id()),
            })?;
        ensure_active(&user)?;
        let link = match self.links.update_tokens(link.id(), tokens).await {
            Ok(link) => link,
            // Unlinked between our read and write; start over.
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(Resolution::ExistingLink { user, link }))
    }

    async fn link_by_email(
        &self,
        provider: Provider,
        identity: &ExternalIdentity,
        user: User,
        tokens: &TokenSet,
    ) -> Result<Option<Resolution>, SsoError> {
        ensure_active(&user)?;
        if self.links.get(user.id(), provider).await?.is_some() {
            return Err(SsoError::AccountAlreadyLinked { provider });
        }

        let Some(upserted) = retry_on_conflict(
            self.links
                .upsert_by_provider_subject(provider, &identity.subject, user.id(), tokens.clone())
                .await,
        )?
        else {
            return Ok(None);
        };

        if upserted.created {
            Ok(Some(Resolution::LinkedByEmail {
                user,
                link: upserted.link,
            }))
        } else {
            self.existing_link(upserted.link, tokens.clone()).await
        }
    }

    async fn create_account(
        &self,
        provider: Provider,
        identity: &ExternalIdentity,
        email: String,
        tokens: &TokenSet,
    ) -> Result<Option<Resolution>, SsoError> {
        let user = User::federated(NewUser {
            email,
            first_name: identity.given_name.clone(),
            last_name: identity.family_name.clone(),
            avatar: identity.picture.clone(),
        });

        let created = retry_on_conflict(
            self.links
                .create_user_with_link(user, provider, &identity.subject, tokens.clone())
                .await,
        )?;

        match created {
            Some(AccountCreation::Created { user, link }) => {
                Ok(Some(Resolution::NewAccount { user, link }))
            }
            Some(AccountCreation::AlreadyLinked { link }) => {
                self.existing_link(link, tokens.clone()).await
            }
            None => Ok(None),
        }
    }
}

fn ensure_active(user: &User) -> Result<(), SsoError> {
    if user.is_active() {
        Ok(())
    } else {
        Err(SsoError::AccountInactive { user_id: user.id() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Secret;
    use crate::memory::MemoryIdentityStore;
    use crate::user::PasswordState;
    use chrono::{Duration, Utc};
    use futures::future::join_all;

    fn identity(subject: &str, email: &str, verified: bool) -> ExternalIdentity {
        ExternalIdentity {
            subject: subject.to_string(),
            email: Some(email.to_string()),
            email_verified: verified,
            given_name: Some("Ada".to_string()),
            family_name: Some("Lovelace".to_string()),
            picture: None,
        }
    }

    fn tokens(access: &str) -> TokenSet {
        TokenSet::new(
            Secret::new(access),
            Some(Secret::new(format!("{access}-refresh"))),
            Utc::now() + Duration::minutes(5),
        )
    }

    fn local_user(email: &str) -> User {
        User::federated(NewUser {
            email: email.to_string(),
            first_name: None,
            last_name: None,
            avatar: None,
        })
    }

    fn resolver(store: &Arc<MemoryIdentityStore>) -> AccountResolver {
        AccountResolver::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn new_identity_creates_user_without_usable_password() {
        let store = Arc::new(MemoryIdentityStore::new());

        let resolution = resolver(&store)
            .resolve(
                Provider::Keycloak,
                &identity("sub-1", "Ada@Campus.edu", true),
                tokens("at-1"),
            )
            .await
            .expect("resolve");

        assert_eq!(resolution.kind(), "new_account");
        let user = resolution.user();
        assert_eq!(user.email(), "ada@campus.edu");
        assert_eq!(user.first_name(), Some("Ada"));
        assert_eq!(user.password(), &PasswordState::Unusable);
        assert_eq!(
            user.check_password(""),
            Err(SsoError::PasswordLoginDisabled)
        );
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn existing_link_overwrites_tokens_in_place() {
        let store = Arc::new(MemoryIdentityStore::new());
        let resolver = resolver(&store);
        let ident = identity("sub-1", "ada@campus.edu", true);

        let first = resolver
            .resolve(Provider::Keycloak, &ident, tokens("at-1"))
            .await
            .expect("first");
        let second = resolver
            .resolve(Provider::Keycloak, &ident, tokens("at-2"))
            .await
            .expect("second");

        assert_eq!(second.kind(), "existing_link");
        assert_eq!(second.user().id(), first.user().id());
        assert_eq!(second.link().id(), first.link().id());
        assert_eq!(second.link().tokens().access_token().expose(), "at-2");
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn verified_email_links_existing_user() {
        let store = Arc::new(MemoryIdentityStore::new());
        let existing = store
            .create_user(local_user("a@x.edu"))
            .await
            .expect("seed");

        let resolution = resolver(&store)
            .resolve(
                Provider::Google,
                &identity("google-7", "A@X.edu", true),
                tokens("at-1"),
            )
            .await
            .expect("resolve");

        assert_eq!(resolution.kind(), "linked_by_email");
        assert_eq!(resolution.user().id(), existing.id());
        assert_eq!(resolution.link().user_id(), existing.id());
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn unverified_email_never_links_existing_user() {
        let store = Arc::new(MemoryIdentityStore::new());
        store
            .create_user(local_user("a@x.edu"))
            .await
            .expect("seed");

        for policy in [
            UnverifiedEmailPolicy::Reject,
            UnverifiedEmailPolicy::CreateAccount,
        ] {
            let err = resolver(&store)
                .with_policy(policy)
                .resolve(
                    Provider::Google,
                    &identity("attacker", "a@x.edu", false),
                    tokens("at-1"),
                )
                .await
                .expect_err("must not link");

            assert_eq!(
                err,
                SsoError::EmailUnverified {
                    email: "a@x.edu".to_string()
                }
            );
        }
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.link_count(), 0);
    }

    #[tokio::test]
    async fn unverified_email_policy_governs_fresh_accounts() {
        let store = Arc::new(MemoryIdentityStore::new());
        let ident = identity("sub-1", "new@x.edu", false);

        let rejected = resolver(&store)
            .resolve(Provider::Keycloak, &ident, tokens("at-1"))
            .await;
        assert!(matches!(rejected, Err(SsoError::EmailUnverified { .. })));

        let created = resolver(&store)
            .with_policy(UnverifiedEmailPolicy::CreateAccount)
            .resolve(Provider::Keycloak, &ident, tokens("at-1"))
            .await
            .expect("create");
        assert_eq!(created.kind(), "new_account");
    }

    #[tokio::test]
    async fn missing_email_is_reported() {
        let store = Arc::new(MemoryIdentityStore::new());
        let mut ident = identity("sub-1", "", true);
        ident.email = None;

        let err = resolver(&store)
            .resolve(Provider::Keycloak, &ident, tokens("at-1"))
            .await
            .expect_err("missing email");
        assert_eq!(
            err,
            SsoError::MissingClaim {
                claim: "email".to_string()
            }
        );
    }

    #[tokio::test]
    async fn inactive_user_is_not_resolved() {
        let store = Arc::new(MemoryIdentityStore::new());
        let resolver = resolver(&store);
        let ident = identity("sub-1", "ada@campus.edu", true);
        let first = resolver
            .resolve(Provider::Keycloak, &ident, tokens("at-1"))
            .await
            .expect("first");

        let mut user = first.into_user();
        user.set_active(false);
        store.put_user(user.clone()).expect("deactivate");

        let err = resolver
            .resolve(Provider::Keycloak, &ident, tokens("at-2"))
            .await
            .expect_err("inactive");
        assert_eq!(err, SsoError::AccountInactive { user_id: user.id() });

        let link = store
            .get(user.id(), Provider::Keycloak)
            .await
            .expect("get")
            .expect("link");
        assert_eq!(link.tokens().access_token(), &Secret::new("at-1"));
    }

    #[tokio::test]
    async fn email_owner_with_other_subject_is_not_relinked() {
        let store = Arc::new(MemoryIdentityStore::new());
        let resolver = resolver(&store);
        resolver
            .resolve(
                Provider::Keycloak,
                &identity("sub-1", "ada@campus.edu", true),
                tokens("at-1"),
            )
            .await
            .expect("first");

        let err = resolver
            .resolve(
                Provider::Keycloak,
                &identity("sub-2", "ada@campus.edu", true),
                tokens("at-2"),
            )
            .await
            .expect_err("second subject");
        assert_eq!(
            err,
            SsoError::AccountAlreadyLinked {
                provider: Provider::Keycloak
            }
        );
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_logins_create_one_user_and_link() {
        let store = Arc::new(MemoryIdentityStore::new());
        let resolver = Arc::new(resolver(&store));
        let ident = identity("sub-race", "race@campus.edu", true);

        let handles = (0..16).map(|i| {
            let resolver = Arc::clone(&resolver);
            let ident = ident.clone();
            tokio::spawn(async move {
                resolver
                    .resolve(Provider::Keycloak, &ident, tokens(&format!("at-{i}")))
                    .await
            })
        });
        let results = join_all(handles).await;

        let user_ids: Vec<_> = results
            .into_iter()
            .map(|joined| {
                joined
                    .expect("task")
                    .expect("resolve")
                    .user()
                    .id()
            })
            .collect();
        assert!(user_ids.iter().all(|id| *id == user_ids[0]));
        assert_eq!(store.user_count(), 1);
        assert_eq!(store.link_count(), 1);
    }
}
