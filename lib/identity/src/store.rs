//! Persistence seams for users and SSO links.
//!
//! The identity crate never talks to a database directly. The server provides
//! PostgreSQL implementations; [`crate::memory`] provides in-process ones.

use async_trait::async_trait;
use campus_sso_core::{SsoLinkId, UserId};

use crate::error::StoreError;
use crate::link::{Provider, SsoLink, TokenSet};
use crate::user::User;

/// The user-record collaborator.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Looks up a user by normalized email. Matching is case-insensitive.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Inserts a user. Fails with `Conflict` if the email is already taken.
    async fn create_user(&self, user: User) -> Result<User, StoreError>;
}

/// Outcome of an insert-or-fetch on `(provider, provider_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// The stored link. When `created` is false this is the pre-existing row,
    /// which may belong to a different user than the one requested.
    pub link: SsoLink,
    pub created: bool,
}

/// Outcome of the atomic "new user plus link" write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountCreation {
    /// Both rows were written.
    Created { user: User, link: SsoLink },
    /// A concurrent flow already linked this external identity; nothing was written.
    AlreadyLinked { link: SsoLink },
}

/// Outcome of [`LinkStore::delete_unless_last`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRemoval {
    Removed,
    /// The link is the owner's only one and was kept.
    LastLink,
}

/// Storage for SSO links and their tokens.
///
/// Token values are only ever read back by the refresh coordinator and the
/// provider client; nothing here is exposed over the API.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Returns the user's link for `provider`, if any.
    async fn get(&self, user_id: UserId, provider: Provider)
    -> Result<Option<SsoLink>, StoreError>;

    async fn find_by_provider_subject(
        &self,
        provider: Provider,
        provider_id: &str,
    ) -> Result<Option<SsoLink>, StoreError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<SsoLink>, StoreError>;

    /// Inserts a link or returns the existing one for `(provider, provider_id)`.
    ///
    /// Never creates a duplicate and never fails because a concurrent caller
    /// won the insert. Fails with `Conflict` only if `user_id` already holds a
    /// link to `provider` for a different subject.
    async fn upsert_by_provider_subject(
        &self,
        provider: Provider,
        provider_id: &str,
        user_id: UserId,
        tokens: TokenSet,
    ) -> Result<Upserted, StoreError>;

    /// Creates `user` and its first link as one unit.
    ///
    /// Fails with `Conflict` if the user's email is taken by then.
    async fn create_user_with_link(
        &self,
        user: User,
        provider: Provider,
        provider_id: &str,
        tokens: TokenSet,
    ) -> Result<AccountCreation, StoreError>;

    /// Overwrites the tokens in place and clears `reauth_required`.
    async fn update_tokens(&self, id: SsoLinkId, tokens: TokenSet) -> Result<SsoLink, StoreError>;

    async fn mark_reauth_required(&self, id: SsoLinkId) -> Result<(), StoreError>;

    /// Deletes a link. The owning user is untouched.
    async fn delete(&self, id: SsoLinkId) -> Result<(), StoreError>;

    /// Deletes a link unless it is the owning user's only one.
    ///
    /// The count and the delete are one atomic step per user, so two
    /// concurrent calls on a two-link account remove exactly one link.
    async fn delete_unless_last(&self, id: SsoLinkId) -> Result<LinkRemoval, StoreError>;
}
